//! Connect protocol client.
//!
//! Typed calls are issued through the generated stubs, which delegate to
//! [`ConnectClient`] with the right [`MethodSpec`]. The client negotiates
//! content type and compression, injects the protocol headers, and decodes
//! structured errors.
//!
//! ```ignore
//! let client = ConnectClient::builder("http://localhost:3000")
//!     .use_proto()
//!     .build()?;
//!
//! let response = client
//!     .call_unary::<GreetRequest, GreetResponse>(GREET, &request, CallOptions::new())
//!     .await?;
//! println!("{}", response.into_inner().greeting);
//! ```

mod blocking;
mod builder;
mod client;
mod error;
mod interceptor;
mod options;
mod streaming;

pub use blocking::BlockingClient;
pub use builder::ConnectClientBuilder;
pub use client::{CallResponse, ConnectClient};
pub use error::ClientError;
pub use interceptor::{
    FnInterceptor, HeaderInterceptor, Interceptor, InterceptorChain, RpcRequest, RpcResponse,
    UnaryFn, UnaryNext,
};
pub use options::CallOptions;
pub use streaming::{Streaming, Trailers};

// Re-export the shared protocol types and the crates generated code leans on.
pub use connect_rs_core as core;
pub use connect_rs_core::{Code, CompressionEncoding, ConnectError, ErrorDetail, MethodSpec};
pub use futures;
