//! Demo methods and publications served by the `ddp_server` binary.

use std::time::Duration;

use ddp::{DdpError, Fields, MethodInvocation, ServerBuilder, Subscription};
use serde_json::{Value, json};
use tracing::debug;

/// Register every demo handler on `builder`.
pub fn register(builder: ServerBuilder) -> ServerBuilder {
    builder
        .method("hello", hello)
        .publish("mysubscription", my_subscription)
        .publish("clock", clock)
}

/// `hello(name)` -> `"Hello <name>"`.
pub async fn hello(invocation: MethodInvocation) -> Result<Value, DdpError> {
    if invocation.params.len() != 1 {
        return Err(DdpError::new("wrong-params", "Missing required parameter"));
    }
    let name = invocation.params[0]
        .as_str()
        .ok_or_else(|| DdpError::new("wrong-params", "Incorrect name"))?;
    Ok(json!(format!("Hello {}", name)))
}

/// Publishes nothing and is ready immediately.
pub async fn my_subscription(subscription: Subscription) -> Result<(), DdpError> {
    subscription.ready()?;
    Ok(())
}

/// One `clock/now` document, updated every second until unsubscribed.
pub async fn clock(subscription: Subscription) -> Result<(), DdpError> {
    subscription.added("clock", "now", now_fields())?;
    subscription.ready()?;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = subscription.stopped() => break,
                _ = interval.tick() => {
                    if subscription.changed("clock", "now", now_fields(), &[]).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("clock stopped for subscription {}", subscription.id());
    });
    Ok(())
}

fn now_fields() -> Fields {
    let now = chrono::Utc::now();
    let mut fields = Fields::new();
    fields.insert("time".to_string(), json!(now.to_rfc3339()));
    fields.insert("epoch_ms".to_string(), json!(now.timestamp_millis()));
    fields
}
