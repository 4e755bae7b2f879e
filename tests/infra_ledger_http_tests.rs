//! HTTP-based integration tests for the ledger JSON-RPC backend.
//!
//! Uses `wiremock` to mock the gateway and exercises contract reads,
//! transaction submission, receipt polling and error-code mapping.

use std::time::Duration;

use mentor_sync::domain::{
    Address, AppError, BackendError, ConfirmationStatus, MutationParams, RecordSource,
    RegisterParams, Role, SearchFilter, SubmissionHandle, WriteReceipt,
};
use mentor_sync::infra::{LedgerClientConfig, LedgerSource};
use secrecy::SecretString;
use serde_json::json;
use wiremock::{
    Match, Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method},
};

const CONTRACT: &str = "0xc0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0";
const ADA: &str = "0x1111111111111111111111111111111111111111";
const GRACE: &str = "0x2222222222222222222222222222222222222222";

fn ada() -> Address {
    ADA.parse().unwrap()
}

fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": result
    }))
}

fn rpc_error(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": { "code": code, "message": message }
    }))
}

fn ledger_user(address: &str, name: &str, role: u8, reputation: u64) -> serde_json::Value {
    json!({
        "walletAddress": address,
        "name": name,
        "role": role,
        "reputation": reputation,
        "registered": true,
        "isVerified": true,
        "skills": ["Rust"],
        "bio": ""
    })
}

fn contract_call(function: &str) -> impl Match + 'static {
    body_partial_json(json!({
        "method": "contract_call",
        "params": { "function": function }
    }))
}

fn source(server: &MockServer, api_key: Option<&str>) -> LedgerSource {
    LedgerSource::new(
        &server.uri(),
        api_key.map(|k| SecretString::from(k.to_string())),
        CONTRACT.parse().unwrap(),
        LedgerClientConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        },
    )
    .unwrap()
}

// ============================================================================
// CONTRACT READS
// ============================================================================

mod read_tests {
    use super::*;

    #[tokio::test]
    async fn test_get_user_decodes_registry_struct() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "jsonrpc": "2.0",
                "method": "contract_call",
                "params": {
                    "contract": CONTRACT,
                    "function": "getUser",
                    "args": [ADA]
                }
            })))
            .respond_with(rpc_result(ledger_user(ADA, "Ada", 0, 12)))
            .expect(1)
            .mount(&server)
            .await;

        let user = source(&server, None).fetch_by_key(&ada()).await.unwrap().unwrap();
        assert_eq!(user.name, "Ada");
        assert_eq!(user.role, Role::Mentor);
        assert_eq!(user.reputation, 12);
        assert!(user.is_verified);
        assert!(user.bio.is_none());
    }

    #[tokio::test]
    async fn test_zeroed_struct_is_not_registered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(contract_call("getUser"))
            .respond_with(rpc_result(json!({
                "walletAddress": "0x0000000000000000000000000000000000000000",
                "name": "",
                "role": 0,
                "reputation": 0,
                "registered": false
            })))
            .mount(&server)
            .await;

        assert!(source(&server, None).fetch_by_key(&ada()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_total_and_page_reads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(contract_call("totalUsers"))
            .respond_with(rpc_result(json!("0x2")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "contract_call",
                "params": { "function": "getUsers", "args": [0, 10] }
            })))
            .respond_with(rpc_result(json!([
                ledger_user(ADA, "Ada", 0, 1),
                ledger_user(GRACE, "Grace", 1, 0),
            ])))
            .mount(&server)
            .await;

        let ledger = source(&server, None);
        assert_eq!(ledger.total_users().await.unwrap(), 2);
        let page = ledger.list_users(0, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1].role, Role::Mentee);
    }

    #[tokio::test]
    async fn test_search_filters_scanned_pages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(contract_call("totalUsers"))
            .respond_with(rpc_result(json!(2)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(contract_call("getUsers"))
            .respond_with(rpc_result(json!([
                ledger_user(ADA, "Ada", 0, 1),
                ledger_user(GRACE, "Grace", 1, 0),
            ])))
            .mount(&server)
            .await;

        let filter = SearchFilter::default().role(Role::Mentor).limit(50);
        let users = source(&server, None).search(&filter).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Ada");
    }

    #[tokio::test]
    async fn test_chain_id_and_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer ledger-key"))
            .and(body_partial_json(json!({"method": "chainId"})))
            .respond_with(rpc_result(json!("0x413")))
            .expect(1)
            .mount(&server)
            .await;

        let ledger = source(&server, Some("ledger-key"));
        assert_eq!(ledger.chain_id().await.unwrap(), 1043);
    }

    #[tokio::test]
    async fn test_gateway_5xx_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = source(&server, None).chain_id().await.unwrap_err();
        assert!(matches!(err, AppError::Backend(BackendError::Unreachable(_))));
        assert!(source(&server, None).health_check().await.is_err());
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

mod transaction_tests {
    use super::*;

    #[tokio::test]
    async fn test_register_sends_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "contract_send",
                "params": {
                    "from": ADA,
                    "function": "register",
                    "args": ["Ada", 1]
                }
            })))
            .respond_with(rpc_result(json!("0xfeed")))
            .expect(1)
            .mount(&server)
            .await;

        let params = MutationParams::Register(RegisterParams::new("Ada", Role::Mentee));
        let receipt = source(&server, None).submit_write(&ada(), &params).await.unwrap();
        assert_eq!(
            receipt,
            WriteReceipt::Pending(SubmissionHandle("0xfeed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_confirm_mentorship_sends_mentee() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "contract_send",
                "params": { "function": "confirmMentorship", "args": [GRACE] }
            })))
            .respond_with(rpc_result(json!("0xbeef")))
            .expect(1)
            .mount(&server)
            .await;

        let params = MutationParams::ConfirmMentorship {
            mentee: GRACE.parse().unwrap(),
        };
        let receipt = source(&server, None).submit_write(&ada(), &params).await.unwrap();
        assert!(matches!(receipt, WriteReceipt::Pending(_)));
    }

    #[tokio::test]
    async fn test_revert_code_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_error(-32000, "execution reverted: already registered"))
            .mount(&server)
            .await;

        let params = MutationParams::Register(RegisterParams::new("Ada", Role::Mentor));
        let err = source(&server, None).submit_write(&ada(), &params).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Backend(BackendError::Rejected { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn test_other_rpc_error_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_error(-32603, "internal error"))
            .mount(&server)
            .await;

        let err = source(&server, None).chain_id().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_await_confirmation_polls_until_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "getTransactionReceipt",
                "params": ["0xfeed"]
            })))
            .respond_with(rpc_result(serde_json::Value::Null))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "getTransactionReceipt"})))
            .respond_with(rpc_result(json!({"status": "0x1"})))
            .mount(&server)
            .await;

        let handle = SubmissionHandle("0xfeed".to_string());
        let status = source(&server, None)
            .await_confirmation(&handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, ConfirmationStatus::Confirmed);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reverted_receipt_reports_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "getTransactionReceipt"})))
            .respond_with(rpc_result(json!({
                "status": "0x0",
                "revertReason": "mentee not registered"
            })))
            .mount(&server)
            .await;

        let handle = SubmissionHandle("0xfeed".to_string());
        let status = source(&server, None).poll_confirmation(&handle).await.unwrap();
        assert_eq!(
            status,
            ConfirmationStatus::Failed("mentee not registered".to_string())
        );
    }
}
