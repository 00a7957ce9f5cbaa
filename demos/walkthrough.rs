//! Runs the order/shipping diagram end to end: reserve stock, approve,
//! call out to a child shipping process, and print the resulting views.

use std::sync::Arc;

use bpmn_engine::{ManagerConfig, MapHandlerModule, ProcessManager};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let manager = ProcessManager::new(ManagerConfig::default());

    let handler = Arc::new(
        MapHandlerModule::new()
            .on_arrive("ReserveStock", |data| Ok(data))
            .exclusive("stockDecision", "inStock", |_| Ok(true))
            .on_task_done("ApproveOrder", |data| Ok(data))
            .get_timeout("approveTimeout", || Ok(60_000.0))
            .on_arrive("Dispatch", |data| Ok(data)),
    );
    manager.add_bpmn(include_str!("order.bpmn"), handler).await?;

    let instance = manager.create_process("order", "order-1").await?;
    instance
        .set_property("customer", json!({ "name": "Ada Lovelace" }))
        .await;
    instance.trigger_event("start", json!({ "sku": "widget" })).await?;

    // ApproveOrder is a wait-task; deliver its completion explicitly.
    instance.task_done("ApproveOrder", json!({ "approved": true })).await;

    println!("state: {:?}", instance.current_state().await);
    println!("history: {:?}", instance.current_history().await);
    println!("views: {:?}", instance.current_views().await);
    Ok(())
}
