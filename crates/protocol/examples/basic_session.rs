//! Basic session example - connect, query the browser, watch targets, attach to a page

use std::sync::Arc;
use std::time::Duration;

use protocol::{Command, SendOptions, Session, SessionConfig, TargetSession};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Serialize)]
struct GetVersion {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Version {
    product: String,
    protocol_version: String,
}

impl Command for GetVersion {
    const METHOD: &'static str = "Browser.getVersion";
    type Response = Version;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    println!("Connecting to: {}", endpoint);

    let config = SessionConfig::default().with_command_timeout(Duration::from_secs(10));
    let session = Session::connect(&endpoint, config).await?;
    println!("Connected! session {}", session.id());

    let version = session.execute(GetVersion {}).await?;
    println!("Browser: {} (protocol {})", version.product, version.protocol_version);

    // Subscribe to target events
    let created = session.subscribe_all("Target.targetCreated", |event: Arc<Value>| {
        println!("Target created: {}", event["targetInfo"]["url"]);
    })?;
    let _: Value = session
        .send("Target.setDiscoverTargets", json!({ "discover": true }))
        .await?;

    let target: Value = session
        .send_with(
            "Target.createTarget",
            json!({ "url": "about:blank" }),
            SendOptions::new().timeout(Duration::from_secs(5)),
        )
        .await?;
    let target_id = target["targetId"].as_str().unwrap_or_default();

    let page = TargetSession::attach(session.clone(), target_id).await?;
    let enabled = page.enable_domains(&["Page", "Runtime"]).await;
    println!("Attached to {} ({} domains enabled)", page.session_id(), enabled);

    let title: Value = page
        .send("Runtime.evaluate", json!({ "expression": "document.title", "returnByValue": true }))
        .await?;
    println!("Title: {}", title["result"]["value"]);

    // Keep alive for a bit to see events
    tokio::time::sleep(Duration::from_secs(2)).await;

    page.detach().await?;
    session.unsubscribe(&created);
    session.close("example finished").await;
    println!("Disconnected: {:?}", session.close_reason());

    Ok(())
}
