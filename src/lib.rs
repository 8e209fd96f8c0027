//! ai-fleet: fleet manager and dispatch layer for pools of OpenAI-compatible
//! chat-completion backends.
//!
//! The library multiplexes many concurrent callers over a heterogeneous set
//! of backends that differ in cost, rate limits and reliability:
//! - [`manager::ClientManager`]: priority-ordered selection with per-caller
//!   affinity, group concurrency limits and an active health-check loop
//! - [`client::BackendClient`]: per-backend state machine folding classified
//!   API failures into status transitions
//! - [`http_api::OpenAiCompatApi`]: connection-pool lifecycle, bounded
//!   retries and the unified error classification
//! - [`state_log::StateLog`]: crash-safe SQLite timeline of per-backend
//!   state intervals
//! - [`admin`]: the HTTP surface the operations dashboard consumes

pub mod adapter;
pub mod admin;
pub mod client;
pub mod config;
pub mod events;
pub mod http_api;
pub mod manager;
pub mod rotator;
pub mod state_log;
pub mod types;

#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;

    use crate::client::{BackendClient, BackendClientConfig, ScriptedAdapter};
    use crate::manager::{ClientManager, ManagerConfig, SelectOptions};
    use crate::state_log::{StateLog, StateLogConfig};
    use crate::types::{ChatMessage, ChatParams, ClientStatus};

    /// Full wiring: manager dispatch, a chat through the client pipeline,
    /// events flowing into the state log, timeline served back out.
    #[tokio::test]
    async fn test_chat_to_timeline_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = Arc::new(
            StateLog::open(StateLogConfig {
                db_path: dir.path().join("fleet.sqlite"),
                run_id: Some("roundtrip".into()),
                ..Default::default()
            })
            .unwrap(),
        );
        log.start();

        let manager = Arc::new(ClientManager::new(ManagerConfig::default()));
        let client = Arc::new(BackendClient::new(
            BackendClientConfig {
                name: "primary".into(),
                priority: 0,
                group_id: "default".into(),
                default_available: true,
            },
            ScriptedAdapter::new(vec![]),
        ));
        log.attach_client(&client);
        manager.register_client(Arc::clone(&client));

        let held = manager
            .get_available_client("caller-1", &SelectOptions::default())
            .unwrap();
        let response = held
            .chat(&[ChatMessage::user("ping")], ChatParams::default(), false)
            .await
            .unwrap();
        assert!(response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap()
            .contains("OK"));
        assert_eq!(client.status(), ClientStatus::Available);

        // Give the consumer task a beat to drain the event channel.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let now = crate::types::now_ts();
        let timeline = log
            .query_timeline("roundtrip", now - 60.0, now + 1.0, None)
            .unwrap();
        let states: Vec<&str> = timeline.items.iter().map(|i| i.state.as_str()).collect();
        assert!(states.contains(&"RUN_SUCCESS"), "timeline: {states:?}");
        assert!(states.contains(&"IDLE_OK"), "timeline: {states:?}");

        log.stop();
    }

    #[test]
    fn test_config_and_stats_smoke() {
        let config = crate::config::Config::from_env();
        assert!(!config.bind_address.is_empty());

        let manager = ClientManager::new(config.manager_config());
        manager.register_client(Arc::new(BackendClient::new(
            BackendClientConfig {
                name: "smoke".into(),
                priority: 20,
                group_id: "default".into(),
                default_available: true,
            },
            ScriptedAdapter::new(vec![]),
        )));

        let stats = manager.get_client_stats();
        assert_eq!(stats["summary"]["total_clients"], 1);
        assert_eq!(stats["clients"][0]["meta"]["priority"], 20);
    }
}
