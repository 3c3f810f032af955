use std::cell::RefCell;
use std::rc::Rc;

use comux::{Coroutine, CoroutineScheduler, Generator};

#[test]
fn generator_values_arrive_in_order_then_default() {
    let sched = CoroutineScheduler::new().unwrap();
    let gen: Generator<i32> = Generator::new(&sched, |g| {
        for i in 1..=3 {
            g.yield_value(i);
        }
    })
    .unwrap();
    let got = Rc::new(RefCell::new(Vec::new()));
    let sink = got.clone();
    let callee = gen.clone();
    Coroutine::new(&sched, move |c| {
        for _ in 0..4 {
            sink.borrow_mut().push(c.call(&callee));
        }
        // the fourth call ran the body to completion
        assert!(!callee.is_alive());
        // and a call on a dead generator returns default without resuming
        sink.borrow_mut().push(c.call(&callee));
    })
    .unwrap();
    sched.run().unwrap();
    assert_eq!(*got.borrow(), vec![1, 2, 3, 0, 0]);
}

#[test]
fn generator_carries_owned_values() {
    let sched = CoroutineScheduler::new().unwrap();
    let gen: Generator<String> = Generator::new(&sched, |g| {
        g.yield_value("first".to_string());
        g.yield_value("second".to_string());
    })
    .unwrap();
    let got = Rc::new(RefCell::new(Vec::new()));
    let sink = got.clone();
    let callee = gen.clone();
    Coroutine::new(&sched, move |c| {
        sink.borrow_mut().push(c.call(&callee));
        sink.borrow_mut().push(c.call(&callee));
        // drive the body to completion so the scheduler can drain
        let last: String = c.call(&callee);
        assert_eq!(last, "");
        assert!(!callee.is_alive());
    })
    .unwrap();
    sched.run().unwrap();
    assert_eq!(*got.borrow(), vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn generator_can_call_another_generator() {
    let sched = CoroutineScheduler::new().unwrap();
    let inner: Generator<i32> = Generator::new(&sched, |g| {
        g.yield_value(10);
        g.yield_value(20);
    })
    .unwrap();
    let inner_callee = inner.clone();
    let outer: Generator<i32> = Generator::new(&sched, move |g| {
        for _ in 0..2 {
            let v = g.call(&inner_callee);
            g.yield_value(v + 1);
        }
    })
    .unwrap();
    let got = Rc::new(RefCell::new(Vec::new()));
    let sink = got.clone();
    let callee = outer.clone();
    let stopper = sched.clone();
    Coroutine::new(&sched, move |c| {
        sink.borrow_mut().push(c.call(&callee));
        sink.borrow_mut().push(c.call(&callee));
        // both generators are mid-yield; leave them and end the loop
        stopper.stop();
    })
    .unwrap();
    sched.run().unwrap();
    assert_eq!(*got.borrow(), vec![11, 21]);
    assert!(inner.is_alive());
    assert!(outer.is_alive());
}

#[test]
fn unfinished_generator_survives_its_caller() {
    let sched = CoroutineScheduler::new().unwrap();
    let gen: Generator<i32> = Generator::new(&sched, |g| {
        for i in 0.. {
            g.yield_value(i);
        }
    })
    .unwrap();
    let callee = gen.clone();
    let stopper = sched.clone();
    Coroutine::new(&sched, move |c| {
        assert_eq!(c.call(&callee), 0);
        assert_eq!(c.call(&callee), 1);
        assert!(callee.is_alive());
        // the generator would wait for its next call forever
        stopper.stop();
    })
    .unwrap();
    sched.run().unwrap();
    assert!(gen.is_alive());
    sched.remove_coroutine(&gen);
}
