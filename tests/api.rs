use anyhow::Result;
use pg_stat_profiler::api::{self, API_KEY_HEADER, ApiContext};
use pg_stat_profiler::collectors::crypto::QueryCipher;
use pg_stat_profiler::store::{KeyStore, StoreHandle};
use reqwest::{Client, StatusCode};
use secrecy::SecretString;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::oneshot;

mod common;

const KEYGEN_SECRET: &str = "keygen-secret";

struct TestServer {
    url: String,
    api_key: String,
    store: StoreHandle,
    client: Client,
    _dir: TempDir,
    _stop: oneshot::Sender<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let (dir, store) = common::spawn_store();
        let keys = KeyStore::open(
            dir.path().join(".pg-stat-profiler.keystr"),
            &common::config_secret(),
        )?;
        let api_key = keys.keys()[0].clone();

        let (listener, addr) = api::bind(0, Some("127.0.0.1".to_string())).await?;
        let url = format!("http://{}", listener.local_addr()?);
        assert!(addr.starts_with("127.0.0.1"));

        let ctx = ApiContext::new(store.clone(), keys, SecretString::from(KEYGEN_SECRET));
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(api::serve(listener, ctx, async {
            let _ = stopped.await;
        }));

        Ok(Self {
            url,
            api_key,
            store,
            client: Client::new(),
            _dir: dir,
            _stop: stop,
        })
    }

    fn profile_url(&self, name: &str) -> String {
        format!("{}/_api/v1.0/profiles/{name}", self.url)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(StatusCode, Value)> {
        let res = req.header(API_KEY_HEADER, &self.api_key).send().await?;
        let status = res.status();
        let body = res.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, body))
    }
}

#[tokio::test]
async fn test_requests_without_key_are_rejected() -> Result<()> {
    let server = TestServer::start().await?;

    let res = server
        .client
        .get(format!("{}/_api/v1.0/profiles", server.url))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.json::<Value>().await?, json!({ "error": "Not Authenticated" }));

    let res = server
        .client
        .get(format!("{}/_api/v1.0/profiles", server.url))
        .header(API_KEY_HEADER, "not-a-key")
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // the bearer form is accepted too
    let res = server
        .client
        .get(format!("{}/_api/v1.0", server.url))
        .bearer_auth(&server.api_key)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.json::<Value>().await?["postgres-stat-profiler"], "welcome");

    Ok(())
}

#[tokio::test]
async fn test_profile_lifecycle() -> Result<()> {
    let server = TestServer::start().await?;
    let url = server.profile_url("p1");

    let (status, body) = server
        .send(server.client.post(&url).json(&common::payload_json("disabled", false)))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "result": "ok" }));

    let (status, body) = server
        .send(server.client.post(&url).json(&common::payload_json("disabled", false)))
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["result"], "error");

    let (status, body) = server.send(server.client.get(&url)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "p1");
    assert_eq!(body["status"], "disabled");
    assert_eq!(body["monitordbstatus"], "unknown");
    assert_eq!(body["monitored_connection"]["host"], "db1.internal");
    assert!(body["monitored_connection"].get("password").is_none());
    assert!(body.get("queryencryptionsecret").is_none());

    let (status, _) = server
        .send(server.client.put(&url).json(&json!({ "status": "enabled" })))
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = server
        .send(server.client.get(format!("{}/_api/v1.0/profiles", server.url)))
        .await?;
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["status"], "enabled");

    let (status, body) = server.send(server.client.delete(&url)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "result": "ok" }));

    let (status, _) = server.send(server.client.get(&url)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server.send(server.client.delete(&url)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_invalid_payloads_are_rejected() -> Result<()> {
    let server = TestServer::start().await?;
    let url = server.profile_url("p1");

    let mut unknown = common::payload_json("enabled", false);
    unknown["surprise"] = json!(true);
    let (status, body) = server.send(server.client.post(&url).json(&unknown)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["result"], "error");

    let mut missing_host = common::payload_json("enabled", false);
    missing_host["report_connection"]
        .as_object_mut()
        .unwrap()
        .remove("host");
    let (status, _) = server.send(server.client.post(&url).json(&missing_host)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .send(
            server
                .client
                .post(&url)
                .header("content-type", "application/json")
                .body("{not json"),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .send(
            server
                .client
                .post(server.profile_url("bad%20name"))
                .json(&common::payload_json("enabled", false)),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // nothing was stored
    assert!(server.store.read_all().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_decrypt_query() -> Result<()> {
    let server = TestServer::start().await?;

    let (status, _) = server
        .send(
            server
                .client
                .post(server.profile_url("plain"))
                .json(&common::payload_json("enabled", false)),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server
        .send(
            server
                .client
                .post(server.profile_url("sealed"))
                .json(&common::payload_json("enabled", true)),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    let cipher = QueryCipher::from_secret(&SecretString::from(common::QUERY_SECRET))?;
    let ciphertext = cipher.encrypt("SELECT * FROM accounts")?;

    let decrypt = |name: &str, query: &str| {
        server
            .client
            .post(format!("{}/decryptQuery", server.profile_url(name)))
            .json(&json!({ "query": query }))
    };

    let (status, body) = server.send(decrypt("sealed", &ciphertext)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query"], "SELECT * FROM accounts");

    let (status, _) = server.send(decrypt("sealed", "bm90IGEgY2lwaGVydGV4dA==")).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = server.send(decrypt("plain", &ciphertext)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.send(decrypt("missing", &ciphertext)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_api_keys_need_the_keygen_secret() -> Result<()> {
    let server = TestServer::start().await?;
    let url = format!("{}/_api/v1.0/apikeys", server.url);

    // an API key is not the keygen secret
    let (status, _) = server.send(server.client.get(&url)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let res = server.client.get(&url).bearer_auth(KEYGEN_SECRET).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await?;
    let keys = body["apikeys"].as_array().unwrap();
    assert_eq!(keys.len(), 5);
    assert!(keys.iter().any(|k| k == server.api_key.as_str()));

    let res = server
        .client
        .post(&url)
        .header(API_KEY_HEADER, KEYGEN_SECRET)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await?;
    assert_eq!(body["result"], "ok");
    assert_eq!(body["apikeys"].as_array().unwrap().len(), 5);

    // the old key stopped working
    let (status, _) = server
        .send(server.client.get(format!("{}/_api/v1.0/profiles", server.url)))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let fresh = body["apikeys"][0].as_str().unwrap();
    let res = server
        .client
        .get(format!("{}/_api/v1.0/profiles", server.url))
        .header(API_KEY_HEADER, fresh)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn test_health_and_metrics_are_public() -> Result<()> {
    let server = TestServer::start().await?;

    let res = server.client.get(format!("{}/health", server.url)).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get("x-app").is_some());
    assert!(res.headers().get("x-request-id").is_some());

    let body: Value = res.json().await?;
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["store"], "ok");
    assert_eq!(body["profiles"], 0);

    let res = server.client.get(format!("{}/metrics", server.url)).send().await?;
    assert_eq!(res.status(), StatusCode::OK);

    Ok(())
}
