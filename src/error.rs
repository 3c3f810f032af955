use std::io;

use thiserror::Error;

/// Failures the runtime reports through `Result`. Everything else (calling a
/// suspension op outside the running coroutine, dropping a live coroutine)
/// is a programming error and panics.
#[derive(Error, Debug)]
pub enum Error {
    #[error("coroutine stack allocation failed")]
    Stack(#[source] io::Error),
    #[error("event descriptor creation failed")]
    EventFd(#[source] io::Error),
    #[error("scheduler poll failed")]
    Poll(#[source] io::Error),
}
