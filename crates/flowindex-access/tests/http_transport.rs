use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flowindex_access::policy::RetryConfig;
use flowindex_access::{
    AccessClientConfig, AccessError, AccessNodeClient, AccessTransport, HttpAccessTransport,
    HttpTransportConfig, RpcCode,
};
use flowindex_core::types::TransactionStatus;

fn block_json(height: u64, guarantees: &[&str]) -> serde_json::Value {
    json!([{
        "header": {
            "id": format!("b{height}"),
            "parent_id": format!("b{}", height - 1),
            "height": height.to_string(),
            "timestamp": "2024-03-01T12:00:00Z",
        },
        "payload": {
            "collection_guarantees": guarantees
                .iter()
                .map(|id| json!({ "collection_id": id, "signer_indices": "" }))
                .collect::<Vec<_>>(),
        },
    }])
}

async fn transport(server: &MockServer) -> HttpAccessTransport {
    HttpAccessTransport::default_for(server.uri()).unwrap()
}

#[tokio::test]
async fn latest_sealed_height() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blocks"))
        .and(query_param("height", "sealed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(block_json(88_000_001, &[])))
        .mount(&server)
        .await;

    let t = transport(&server).await;
    assert_eq!(t.latest_sealed_height().await.unwrap(), 88_000_001);
}

#[tokio::test]
async fn block_with_guarantees() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blocks"))
        .and(query_param("height", "500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(block_json(500, &["c1", "c2"])))
        .mount(&server)
        .await;

    let t = transport(&server).await;
    let h = t.block_by_height(500).await.unwrap();
    assert_eq!(h.id, "b500");
    assert_eq!(h.parent_id, "b499");
    let ids: Vec<&str> = h.collection_guarantees.iter().map(|g| g.collection_id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);
}

#[tokio::test]
async fn empty_block_list_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blocks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let err = transport(&server).await.block_by_height(7).await.unwrap_err();
    assert_eq!(err.code(), Some(RpcCode::NotFound));
}

#[tokio::test]
async fn transaction_decodes_script_and_arguments() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/transactions/t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "t1",
            // "import EVM from 0x1"
            "script": "aW1wb3J0IEVWTSBmcm9tIDB4MQ==",
            "arguments": ["eyJ0eXBlIjoiVUludDgiLCJ2YWx1ZSI6IjEifQ=="],
            "reference_block_id": "b1",
            "gas_limit": "9999",
            "payer": "f919ee77447b7497",
            "proposal_key": { "address": "e467b9dd11fa00df", "key_index": "2", "sequence_number": "41" },
            "authorizers": ["e467b9dd11fa00df"],
        })))
        .mount(&server)
        .await;

    let tx = transport(&server).await.transaction("t1").await.unwrap();
    assert_eq!(tx.script, "import EVM from 0x1");
    assert_eq!(tx.arguments, vec![r#"{"type":"UInt8","value":"1"}"#]);
    assert_eq!(tx.gas_limit, 9999);
    assert_eq!(tx.proposal_key.key_index, 2);
    assert_eq!(tx.proposal_key.sequence_number, 41);
    assert!(!tx.is_system());
}

#[tokio::test]
async fn account_contract_names() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/accounts/1654653399040a61"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "address": "1654653399040a61",
            "balance": "100000",
            "contracts": { "FlowToken": "Y29kZQ==", "FungibleToken": "Y29kZQ==" },
        })))
        .mount(&server)
        .await;

    let acct = transport(&server).await.account("1654653399040a61").await.unwrap();
    assert_eq!(acct.balance, 100_000);
    assert_eq!(acct.contracts, vec!["FlowToken", "FungibleToken"]);
}

#[tokio::test]
async fn http_status_maps_to_rpc_code() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/transactions/slow"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "code": 503, "message": "overloaded" })))
        .mount(&server)
        .await;

    let err = transport(&server).await.transaction("slow").await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err, AccessError::Rpc { code: RpcCode::Unavailable, ref message } if message == "overloaded"));
}

fn client(servers: &[&MockServer]) -> AccessNodeClient {
    let transports: Vec<Arc<dyn AccessTransport>> = servers
        .iter()
        .map(|s| Arc::new(HttpAccessTransport::default_for(s.uri()).unwrap()) as Arc<dyn AccessTransport>)
        .collect();
    let config = AccessClientConfig {
        rate_limit: None,
        ..Default::default()
    };
    AccessNodeClient::new(transports, config, CancellationToken::new()).unwrap()
}

#[tokio::test]
async fn legacy_results_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/transaction_results/aa"))
        .respond_with(ResponseTemplate::new(501).set_body_json(json!({
            "code": 501,
            "message": "unknown service flow.access.AccessAPI",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/legacy/v1/transaction_results/aa"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 4,
            "status_code": 0,
            "error_message": "",
            "events": [{
                "type": "A.1654653399040a61.FlowToken.TokensDeposited",
                "transaction_id": "",
                "transaction_index": 0,
                "event_index": 1,
                "payload": "e30=",
            }],
        })))
        .expect(2)
        .mount(&server)
        .await;

    let c = client(&[&server]);
    for _ in 0..2 {
        let r = c.transaction_result(10, "aa").await.unwrap();
        assert_eq!(r.status, TransactionStatus::Sealed);
        assert_eq!(r.events[0].transaction_id, "aa");
        assert_eq!(r.events[0].payload, b"{}");
    }
    assert!(c.endpoints().get(0).unwrap().uses_legacy_results());
}

#[tokio::test]
async fn learns_spork_floor_and_reroutes() {
    let live = MockServer::start().await;
    let archive = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blocks"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": 404,
            "message": "block height 1200 is less than the spork root block height 137390146",
        })))
        .mount(&live)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/blocks"))
        .and(query_param("height", "1200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(block_json(1200, &[])))
        .expect(1)
        .mount(&archive)
        .await;

    let c = client(&[&live, &archive]);
    c.endpoints().get(0).unwrap().set_floor(1000);

    let h = c.block_header(1200).await.unwrap();
    assert_eq!(h.height, 1200);
    assert_eq!(c.endpoints().get(0).unwrap().floor(), 137_390_146);
    assert_eq!(c.route(1200).unwrap(), archive.uri());
}

#[tokio::test]
async fn connect_applies_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blocks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(block_json(7, &[]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let config = AccessClientConfig {
        rate_limit: None,
        retry: RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            ..Default::default()
        },
        transport: HttpTransportConfig {
            request_timeout: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    };
    let c = AccessNodeClient::connect([server.uri()], config, CancellationToken::new()).unwrap();

    let err = c.block_header(7).await.unwrap_err();
    assert!(err.to_string().contains("max retries"), "{err}");
    assert!(c.endpoints().get(0).unwrap().is_disabled());
}
