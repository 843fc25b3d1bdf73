//! Connect RPC server runtime for axum.
//!
//! The runtime decodes Connect unary and streaming requests, dispatches them
//! to typed handlers, and encodes responses, with protocol negotiation
//! handled by [`ConnectLayer`] and routing by the generated per-service
//! builders plus [`MakeServiceBuilder`].
//!
//! A minimal server:
//!
//! ```rust,ignore
//! let greeter = GreetServiceBuilder::new()
//!     .greet(|ctx, req: GreetRequest| async move {
//!         Ok(GreetResponse { greeting: format!("Hello, {}!", req.name) })
//!     })
//!     .build();
//!
//! let app = MakeServiceBuilder::new().add_router(greeter).build();
//! axum::serve(listener, app).await?;
//! ```

pub mod context;
pub mod handler;
pub mod interceptor;
pub mod layer;
pub mod limits;
pub mod request;
pub mod response;
pub mod service_builder;

pub use context::{ConnectContext, RequestContext, ServerConfig};
pub use handler::{bidi_stream, client_stream, server_stream, unary};
pub use interceptor::{
    BidiChain, BidiInterceptor, ClientStreamChain, ClientStreamInterceptor, MetadataAdapter,
    MetadataInterceptor, ServerStreamChain, ServerStreamInterceptor, UnaryChain, UnaryInterceptor,
};
pub use layer::{ConnectLayer, ConnectService};
pub use limits::{DEFAULT_MAX_RECEIVE_BYTES, MessageLimits};
pub use request::Streaming;
pub use service_builder::MakeServiceBuilder;

// Re-export the shared protocol types and the crates generated code leans on.
pub use connect_rs_core as core;
pub use connect_rs_core::{Code, ConnectError, ErrorDetail, MethodSpec, RpcKind};
pub use futures;
pub use pbjson;
pub use pbjson_types;
pub use prost;
pub use serde;

pub mod prelude {
    //! The types most servers need.
    pub use crate::context::{RequestContext, ServerConfig};
    pub use crate::handler::{bidi_stream, client_stream, server_stream, unary};
    pub use crate::layer::ConnectLayer;
    pub use crate::limits::MessageLimits;
    pub use crate::request::Streaming;
    pub use crate::service_builder::MakeServiceBuilder;
    pub use connect_rs_core::{
        Code, ConnectError, ErrorDetail, IdempotencyLevel, MethodSpec, RpcKind,
    };
}
