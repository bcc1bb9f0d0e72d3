use crate::controller::{Controller, StartError};
use zbus::interface;

/// D-Bus interface for the rollcall daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    pub controller: Controller,
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Start a recognition session; returns the status right after starting.
    async fn start_recognition(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start requested");
        match self.controller.start().await {
            Ok(view) => to_json(&view),
            Err(e @ StartError::Rejected(_)) => {
                tracing::info!(reason = %e, "start rejected");
                Err(zbus::fdo::Error::Failed(e.to_string()))
            }
            Err(e) => {
                tracing::error!(error = %e, "start failed");
                Err(zbus::fdo::Error::Failed(e.to_string()))
            }
        }
    }

    /// Stop the running session. False when nothing was running.
    async fn stop_recognition(&self) -> bool {
        let stopped = self.controller.stop().await;
        tracing::info!(stopped, "stop requested");
        stopped
    }

    /// Return the current recognition status.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let view = self.controller.status().await;
        let camera = self.controller.camera().await;

        let mut value =
            serde_json::to_value(&view).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if let Some(map) = value.as_object_mut() {
            map.insert("version".into(), env!("CARGO_PKG_VERSION").into());
            map.insert(
                "camera".into(),
                camera.unwrap_or_else(|| "unavailable".into()).into(),
            );
        }
        Ok(value.to_string())
    }

    /// Employees known to the last session, with their descriptor counts.
    async fn roster(&self) -> zbus::fdo::Result<String> {
        let entries: Vec<serde_json::Value> = match self.controller.labels().await {
            Some(labels) => labels
                .iter()
                .map(|set| {
                    serde_json::json!({
                        "name": set.label,
                        "descriptors": set.descriptors.len(),
                    })
                })
                .collect(),
            None => Vec::new(),
        };
        to_json(&entries)
    }
}
