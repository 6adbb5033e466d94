//! HTTP API for the product registry
//!
//! ## Products
//! - `POST /api/products` - Register `{productDetails, manufacturerAddress}`
//! - `POST /api/products/bulk` - Register `{products, manufacturerAddress}`;
//!   `207` if some accepted products could not be cached
//! - `GET /api/products` - List every cached product the ledger knows
//! - `GET /api/products/{hash}` - Merged product record
//! - `GET /api/products/{hash}/history` - Lifecycle timeline
//! - `POST /api/products/{hash}/transfer` - `{from, to}`
//! - `PUT /api/products/status` - `{adminAddress, hash, status}`
//! - `DELETE /api/products/{hash}` - `{adminAddress}`
//! - `POST /api/verify` - `{hash}` → `{isValid}`
//!
//! ## Users
//! - `GET /api/users` - Role mirror snapshot
//! - `POST /api/users/role` - `{adminAddress, userAddress, role}`
//! - `GET /api/users/{address}/role`
//! - `GET /api/users/{address}/products`
//!
//! ## Other
//! - `GET /api/stats`
//! - `GET /health`
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST -H "Content-Type: application/json" \
//!      -d '{"productDetails":{"name":"Widget","batch":"B1"},"manufacturerAddress":"0xabc"}' \
//!      http://localhost:3001/api/products
//!
//! curl -X POST -d '{"hash":"0x5f1c..."}' http://localhost:3001/api/verify
//! ```

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::fingerprint::Fingerprint;
use crate::model::{Address, ProductMetadata, Role};
use crate::registry::Registry;
use crate::response;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    product_details: ProductMetadata,
    manufacturer_address: Address,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkRegisterRequest {
    products: Vec<ProductMetadata>,
    manufacturer_address: Address,
}

#[derive(Deserialize)]
struct TransferRequest {
    from: Address,
    to: Address,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusRequest {
    admin_address: Address,
    hash: Fingerprint,
    status: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveRequest {
    admin_address: Address,
}

#[derive(Deserialize)]
struct VerifyRequest {
    hash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleRequest {
    admin_address: Address,
    user_address: Address,
    role: Role,
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, RegistryError> {
    serde_json::from_slice(body)
        .map_err(|e| RegistryError::Validation(format!("invalid request body: {}", e)))
}

/// HTTP server state
pub struct HttpServer {
    registry: Arc<Registry>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(registry: Arc<Registry>, bind_addr: SocketAddr) -> Self {
        Self {
            registry,
            bind_addr,
        }
    }

    /// Run the HTTP server until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), RegistryError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.recv() => {
                    info!("HTTP server shutting down");
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let body = req.into_body().collect().await?.to_bytes();
        Ok(self.route(method, &path, body).await)
    }

    /// Dispatch a fully read request
    pub async fn route(&self, method: Method, path: &str, body: Bytes) -> Response<Full<Bytes>> {
        debug!(method = %method, path = %path, "Incoming request");

        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match (method, segments.as_slice()) {
            (Method::GET, ["health"]) => response::ok(&serde_json::json!({
                "status": "ok",
                "cachedProducts": self.registry.cache().len(),
            })),

            // Products
            (Method::POST, ["api", "products"]) => {
                response::from_create_result(self.handle_register(&body).await)
            }
            (Method::GET, ["api", "products"]) => response::from_result(self.registry.list_all().await),
            (Method::POST, ["api", "products", "bulk"]) => {
                match self.handle_bulk_register(&body).await {
                    Ok(result) if !result.is_complete() => {
                        response::json_response(StatusCode::MULTI_STATUS, &result)
                    }
                    other => response::from_create_result(other),
                }
            }
            (Method::PUT, ["api", "products", "status"]) => {
                response::from_result(self.handle_set_status(&body).await)
            }
            (Method::GET, ["api", "products", hash]) => {
                response::from_result(self.handle_details(hash).await)
            }
            (Method::DELETE, ["api", "products", hash]) => {
                response::from_result(self.handle_remove(hash, &body).await)
            }
            (Method::GET, ["api", "products", hash, "history"]) => {
                response::from_result(self.handle_history(hash).await)
            }
            (Method::POST, ["api", "products", hash, "transfer"]) => {
                response::from_result(self.handle_transfer(hash, &body).await)
            }
            (Method::POST, ["api", "verify"]) => response::from_result(self.handle_verify(&body).await),

            // Users
            (Method::GET, ["api", "users"]) => response::ok(&self.registry.users()),
            (Method::POST, ["api", "users", "role"]) => {
                response::from_result(self.handle_assign_role(&body).await)
            }
            (Method::GET, ["api", "users", address, "role"]) => {
                response::from_result(self.handle_role_of(address).await)
            }
            (Method::GET, ["api", "users", address, "products"]) => {
                response::from_result(self.handle_user_products(address).await)
            }

            (Method::GET, ["api", "stats"]) => response::from_result(self.registry.stats().await),

            (_, ["health"]) | (_, ["api", ..]) if is_known_path(&segments) => {
                response::method_not_allowed()
            }
            _ => response::not_found("Not Found"),
        }
    }

    async fn handle_register(&self, body: &Bytes) -> Result<serde_json::Value, RegistryError> {
        let req: RegisterRequest = parse_body(body)?;
        let registration = self
            .registry
            .register(req.product_details, &req.manufacturer_address)
            .await?;
        Ok(serde_json::json!({
            "fingerprint": registration.fingerprint,
            "alreadyRegistered": registration.already_registered,
            "qrPayload": registration.fingerprint,
        }))
    }

    async fn handle_bulk_register(
        &self,
        body: &Bytes,
    ) -> Result<crate::registry::BulkRegistration, RegistryError> {
        let req: BulkRegisterRequest = parse_body(body)?;
        self.registry
            .bulk_register(req.products, &req.manufacturer_address)
            .await
    }

    async fn handle_details(&self, hash: &str) -> Result<crate::model::ProductRecord, RegistryError> {
        let fp: Fingerprint = hash.parse()?;
        self.registry.get_details(&fp).await
    }

    async fn handle_history(
        &self,
        hash: &str,
    ) -> Result<Vec<crate::history::HistoryEvent>, RegistryError> {
        let fp: Fingerprint = hash.parse()?;
        self.registry.history(&fp).await
    }

    async fn handle_transfer(&self, hash: &str, body: &Bytes) -> Result<serde_json::Value, RegistryError> {
        let fp: Fingerprint = hash.parse()?;
        let req: TransferRequest = parse_body(body)?;
        self.registry.transfer_ownership(&fp, &req.from, &req.to).await?;
        Ok(serde_json::json!({ "fingerprint": fp, "owner": req.to }))
    }

    async fn handle_set_status(&self, body: &Bytes) -> Result<serde_json::Value, RegistryError> {
        let req: StatusRequest = parse_body(body)?;
        self.registry
            .set_validity(&req.hash, req.status, &req.admin_address)
            .await?;
        Ok(serde_json::json!({ "fingerprint": req.hash, "valid": req.status }))
    }

    async fn handle_remove(&self, hash: &str, body: &Bytes) -> Result<serde_json::Value, RegistryError> {
        let fp: Fingerprint = hash.parse()?;
        let req: RemoveRequest = parse_body(body)?;
        self.registry.remove(&fp, &req.admin_address).await?;
        Ok(serde_json::json!({ "fingerprint": fp, "removed": true }))
    }

    async fn handle_verify(&self, body: &Bytes) -> Result<serde_json::Value, RegistryError> {
        let req: VerifyRequest = parse_body(body)?;
        let fp: Fingerprint = req.hash.parse()?;
        let is_valid = self.registry.verify(&fp).await?;
        Ok(serde_json::json!({ "fingerprint": fp, "isValid": is_valid }))
    }

    async fn handle_assign_role(&self, body: &Bytes) -> Result<serde_json::Value, RegistryError> {
        let req: RoleRequest = parse_body(body)?;
        self.registry
            .assign_role(&req.admin_address, &req.user_address, req.role)
            .await?;
        Ok(serde_json::json!({ "address": req.user_address, "role": req.role }))
    }

    async fn handle_role_of(&self, address: &str) -> Result<serde_json::Value, RegistryError> {
        let address: Address = address.parse()?;
        let role = self.registry.role_of(&address).await;
        Ok(serde_json::json!({
            "address": address,
            "role": role,
            "roleName": role.as_str(),
        }))
    }

    async fn handle_user_products(
        &self,
        address: &str,
    ) -> Result<Vec<crate::model::ProductRecord>, RegistryError> {
        let address: Address = address.parse()?;
        self.registry.list_for_user(&address).await
    }
}

/// Paths that exist under some other method
fn is_known_path(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["health"]
            | ["api", "products"]
            | ["api", "products", _]
            | ["api", "products", _, "history" | "transfer"]
            | ["api", "verify"]
            | ["api", "users"]
            | ["api", "users", "role"]
            | ["api", "users", _, "role" | "products"]
            | ["api", "stats"]
    )
}
