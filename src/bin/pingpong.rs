use comux::{Coroutine, CoroutineOpts, CoroutineScheduler, Generator};

fn main() {
    let sched = CoroutineScheduler::new().unwrap();

    for name in ["ping", "pong"] {
        Coroutine::with_opts(
            &sched,
            move |c| {
                for i in 0..5 {
                    println!("{} {}", c.name(), i);
                    c.yield_now();
                }
            },
            CoroutineOpts {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    }

    let gen: Generator<i32> = Generator::new(&sched, |g| {
        for i in 1..=3 {
            g.yield_value(i * 100);
        }
    })
    .unwrap();

    Coroutine::new(&sched, move |c| loop {
        let v = c.call(&gen);
        if !gen.is_alive() {
            break;
        }
        println!("generated {v}");
    })
    .unwrap();

    sched.run().unwrap();
}
