use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use procflow::{ChannelEvent, ChannelOptions, EngineBuilder, ProcessDefinition, Vars};

const TENANT: u64 = 1;

fn main() {
    let engine = EngineBuilder::new().build().unwrap();

    engine.launch();

    let text = include_str!("./order.json");

    let definition = ProcessDefinition::from_json(text).unwrap();

    let definition_id = engine.deploy(TENANT, &definition).unwrap();
    engine.enable_process_definition(TENANT, definition_id).unwrap();

    let completed = Arc::new(AtomicBool::new(false));
    let done = completed.clone();
    ChannelEvent::channel(engine.channel(), ChannelOptions::default()).unwrap().on_process_completed(move |tenant_id, pid| {
        println!("Process completed, tenant: {}, pid: {}", tenant_id, pid);
        done.store(true, Ordering::SeqCst);
    });

    ChannelEvent::channel(engine.channel(), ChannelOptions::default()).unwrap().on_flow_node_failed(move |e| {
        println!("Flow node failed: {:?}", e);
    });

    let pid = engine.start_process(TENANT, definition_id, None, Vars::new().with("order_id", "A-17")).unwrap();
    engine.send_message(TENANT, "paid", Some("A-17".to_string()), Vars::new().with("amount", 120)).unwrap();

    while !completed.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let archived = engine.archived_process_instance(TENANT, pid).unwrap();
    let outputs = serde_json::to_value(&archived.data).unwrap();
    println!("Outputs: {:#?}", outputs);

    engine.shutdown();
}
