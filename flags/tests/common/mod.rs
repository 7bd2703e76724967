use std::net::SocketAddr;

use flags::audit::MemoryAuditRecorder;
use flags::redis::MockRedisClient;
use flags::store::MemoryFlagStore;
use flags::test_utils::setup_test_app;

/// A server bound to an ephemeral port over in-memory collaborators, plus
/// handles to those collaborators for assertions.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub store: MemoryFlagStore,
    pub redis: MockRedisClient,
    pub audit: MemoryAuditRecorder,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn start() -> ServerHandle {
        let app = setup_test_app();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().unwrap();

        let router = app.router;
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("test server failed");
        });

        ServerHandle {
            addr,
            store: app.store,
            redis: app.redis,
            audit: app.audit,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    pub async fn post_json(&self, path: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub async fn post_json_as(
        &self,
        path: &str,
        body: &serde_json::Value,
        actor: &str,
    ) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("X-Actor", actor)
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub async fn put_json(&self, path: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .put(self.url(path))
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client.delete(self.url(path)).send().await.unwrap()
    }
}
