// HTTP transport for raft RPCs
// Client side posts JSON to peers with reqwest; server side is a pair of actix-web routes

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpResponse, Responder, Scope, post, web};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::maintain::RaftMaintainService;
use super::network::{RaftRpc, RaftRpcReply, RaftTransport, RpcHandler, TransportError};
use super::server::RaftServer;
use super::types::Peer;
use crate::error::{ConsistencyError, Result};

/// Posts every RPC to `http://<peer>/raft/rpc`
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| ConsistencyError::Startup(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn call(&self, target: &Peer, raft_rpc: RaftRpc) -> std::result::Result<RaftRpcReply, TransportError> {
        let url = format!("http://{}/raft/rpc", target.address());
        debug!(peer = %target, rpc = raft_rpc.name(), "Sending raft rpc");

        let resp = self
            .client
            .post(&url)
            .json(&raft_rpc)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    TransportError::Unreachable {
                        peer: target.address(),
                        message: e.to_string(),
                    }
                } else {
                    TransportError::Network {
                        peer: target.address(),
                        message: e.to_string(),
                    }
                }
            })?;

        if !resp.status().is_success() {
            return Err(TransportError::Network {
                peer: target.address(),
                message: format!("unexpected status {}", resp.status()),
            });
        }

        resp.json::<RaftRpcReply>()
            .await
            .map_err(|e| TransportError::Network {
                peer: target.address(),
                message: e.to_string(),
            })
    }
}

#[post("/rpc")]
async fn rpc(server: web::Data<RaftServer>, body: web::Json<RaftRpc>) -> impl Responder {
    let reply = server.handle(body.into_inner()).await;
    HttpResponse::Ok().json(reply)
}

#[post("/ops")]
async fn ops(
    server: web::Data<RaftServer>,
    args: web::Json<HashMap<String, String>>,
) -> impl Responder {
    let service = RaftMaintainService::new(server.into_inner());
    HttpResponse::Ok().json(service.execute(&args).await)
}

pub fn routes() -> Scope {
    web::scope("/raft").service(rpc).service(ops)
}

/// Mount the raft routes backed by `server`
pub fn configure(cfg: &mut web::ServiceConfig, server: Arc<RaftServer>) {
    cfg.app_data(web::Data::from(server)).service(routes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorCode;
    use crate::raft::config::RaftConfig;
    use crate::raft::network::LocalTransport;
    use actix_web::{App, test};

    fn server(dir: &std::path::Path) -> Arc<RaftServer> {
        let config = RaftConfig {
            data_dir: dir.to_path_buf(),
            self_member: "127.0.0.1:7201".to_string(),
            ..RaftConfig::default()
        };
        RaftServer::new(config, Arc::new(LocalTransport::new())).unwrap()
    }

    #[actix_web::test]
    async fn test_rpc_route_replies_json() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let app = test::init_service(App::new().configure(|cfg| configure(cfg, server.clone()))).await;

        let req = test::TestRequest::post()
            .uri("/raft/rpc")
            .set_json(RaftRpc::GetLeader {
                group: "naming".to_string(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let reply: RaftRpcReply = test::read_body_json(resp).await;
        match reply {
            RaftRpcReply::Error(e) => assert_eq!(e.code, RemoteErrorCode::NoSuchGroup),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[actix_web::test]
    async fn test_ops_route_rejects_unknown_command() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let app = test::init_service(App::new().configure(|cfg| configure(cfg, server.clone()))).await;

        let req = test::TestRequest::post()
            .uri("/raft/ops")
            .set_json(serde_json::json!({"command": "restart"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
        let result = transport
            .call(
                &Peer::new("127.0.0.1", port),
                RaftRpc::GetLeader {
                    group: "naming".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }
}
