//! Connector end-to-end tests.
//!
//! Note that this is setup as a "unit test" in that it is part of the `src/`
//! directory. This is done intentionally as Cargo builds separate binaries
//! for each file in `tests/`, which makes `cargo test` slower.

use {
    anyhow::Context,
    std::io::Write,
    tokio::{sync::oneshot, task::JoinHandle},
};

mod forwarding;
mod hydration;

/// A full connector node running in-process on ephemeral ports.
pub struct ConnectorNode {
    pub api_url: String,
    pub btp_url: String,
    #[allow(dead_code)] // only needed for Drop handling
    tempfile: Option<tempfile::TempPath>,
    #[allow(dead_code)] // keeps the event-store directory alive
    tempdir: Option<tempfile::TempDir>,
    handle: JoinHandle<()>,
}

impl ConnectorNode {
    /// Starts a node from a literal TOML configuration. The config should
    /// bind both listeners to port 0; the real addresses come back through
    /// the bind channel.
    pub async fn start(config: String, tempdir: Option<tempfile::TempDir>) -> Self {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.as_bytes()).unwrap();
        let path = file.into_temp_path();

        let (bind, bind_receiver) = oneshot::channel();
        let args = vec![
            "/test/connector/path".to_owned(),
            "--log=warn,connector=debug".to_owned(),
            format!("--config={}", path.display()),
        ];
        let handle = tokio::spawn(crate::run(args, Some(bind)));
        let (api_addr, btp_addr) = bind_receiver.await.unwrap();

        Self {
            api_url: format!("http://{api_addr}"),
            btp_url: format!("ws://{btp_addr}/btp"),
            tempfile: Some(path),
            tempdir,
            handle,
        }
    }

    pub async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let response = reqwest::get(format!("{}{path}", self.api_url)).await?;
        anyhow::ensure!(
            response.status().is_success(),
            "HTTP {} for {path}",
            response.status()
        );
        response.json().await.context("response is not JSON")
    }

    /// Polls the event API until `predicate` accepts the response, with a
    /// bounded number of attempts. The store writes are asynchronous, so
    /// queries right after a packet can race the insert.
    pub async fn await_events(
        &self,
        query: &str,
        predicate: impl Fn(&serde_json::Value) -> bool,
    ) -> serde_json::Value {
        for _ in 0..50 {
            if let Ok(body) = self.get_json(&format!("/api/accounts/events?{query}")).await {
                if predicate(&body) {
                    return body;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        panic!("events matching {query:?} did not show up in time");
    }
}

impl Drop for ConnectorNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A single-node topology with two inbound peers and a route to `peer-c`,
/// the standard fixture for forwarding tests.
pub fn relay_config(tempdir: &tempfile::TempDir) -> String {
    format!(
        r#"
        [node]
        id = "node-b"
        ilp-address = "g.node-b"
        api-addr = "127.0.0.1:0"
        btp-addr = "127.0.0.1:0"

        [[peers]]
        id = "peer-a"
        secret = "secret-a"

        [[peers]]
        id = "peer-c"
        secret = "secret-c"

        [[routes]]
        prefix = "g.c"
        next-hop = "peer-c"

        [event-store]
        path = "{}"
        "#,
        tempdir.path().join("events.db").display()
    )
}
