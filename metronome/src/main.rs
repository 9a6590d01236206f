use chrono::Duration;
use metronome::{Cron, Gap, Limit, Scheduler};
use std::sync::Arc;
use std::time::Duration as StdDuration;

#[tokio::main]
async fn main() {
    env_logger::init();
    let scheduler = Scheduler::with_zone(chrono_tz::Tz::America__Chicago);

    scheduler.add_fn(
        "hello",
        |_state, _cancel| async {
            println!("Hello World from an async job!");
            let _: i32 = "asd".parse()?;
            Ok(())
        },
        Arc::new(Limit::new(5, Arc::new(Gap::new(Duration::seconds(30))))),
    );

    scheduler.add_fn(
        "on-the-minute",
        |state: metronome::JobState, _cancel| async move {
            println!(
                "Job {} fired; it was due at {:?}.",
                state.name(),
                state.due()
            );
            Ok(())
        },
        Arc::new(Cron::parse("0 * * * * *").expect("cron expression is valid")),
    );

    for i in 0..10 {
        scheduler.add_fn(
            format!("looper-{i}"),
            move |_state, _cancel| async move {
                println!("This is a print statement from index {i} of the loop.");
                let _ = "5".parse::<i32>()?;
                Ok(())
            },
            Arc::new(Limit::new(2, Arc::new(Gap::new(Duration::seconds(20))))),
        );
    }

    tokio::time::sleep(StdDuration::from_secs(180)).await;
    scheduler.dispose();

    println!("Hello, world from main!");
}
