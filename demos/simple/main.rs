use std::{sync::mpsc, time::Duration};

use splyt::{EntityInfo, InitParams, Session, TimeoutMode, TXN_SUCCESS};

pub fn main() {
    env_logger::init();

    let customer_id = std::env::var("SPLYT_CUSTOMER_ID").unwrap();
    let session = Session::new().unwrap();

    // Block waiting for init. Until it completes, tuning variables return their defaults.
    let (sender, receiver) = mpsc::channel();
    session.init(
        InitParams {
            user: EntityInfo::user("test-user").with_property("tier", "gold"),
            log_enabled: true,
            ..InitParams::new(customer_id)
        },
        move |result| sender.send(result).unwrap(),
    );
    receiver.recv().unwrap().unwrap();

    let speed = session.get_var_as("speed", 1.0);
    println!("Tuned speed: {:?}", speed);

    let mut level = session.transaction("level").id("1-1");
    level
        .begin(Duration::from_secs(300), TimeoutMode::Transaction)
        .unwrap();
    level.update(50).unwrap();
    level.end(TXN_SUCCESS);

    session
        .purchase()
        .price(0.99, "usd")
        .item_name("extra life")
        .begin_and_end();

    // Delivers queued events and waits for background threads.
    session.flush();
    session.shutdown().unwrap();
}
