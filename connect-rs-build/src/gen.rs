//! Code emission.
//!
//! One small data model (`ServiceModel` / `MethodModel`) feeds both drivers:
//! the `prost-build` service generator fills it from `prost_build::Service`,
//! the protoc plugin from raw file descriptors. Emission is deterministic —
//! methods are emitted in declaration order and imports are fixed — so
//! regenerating unchanged protos is a no-op.

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::{format_ident, quote};

use crate::{GeneratorConfig, MethodNaming};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MethodKind {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Idempotency {
    Unknown,
    NoSideEffects,
    Idempotent,
}

#[derive(Debug, Clone)]
pub(crate) struct MethodModel {
    /// Method name as declared in the proto file.
    pub proto_name: String,
    /// Rust path of the input message type, relative to the generated module
    /// (resolved through `use super::*;`).
    pub input_type: String,
    pub output_type: String,
    pub kind: MethodKind,
    pub idempotency: Idempotency,
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceModel {
    pub package: String,
    /// Service name as declared in the proto file.
    pub proto_name: String,
    pub methods: Vec<MethodModel>,
}

impl ServiceModel {
    fn full_name(&self) -> String {
        if self.package.is_empty() {
            self.proto_name.clone()
        } else {
            format!("{}.{}", self.package, self.proto_name)
        }
    }
}

// Identifiers that cannot be used as method names; a trailing underscore is
// appended instead of switching to raw identifiers so generated names stay
// greppable.
const RESERVED: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "static", "struct", "super", "trait", "true", "type",
    "union", "unsafe", "use", "where", "while",
];

pub(crate) fn method_ident(proto_name: &str, naming: MethodNaming) -> proc_macro2::Ident {
    let mut name = match naming {
        MethodNaming::Snake => proto_name.to_case(Case::Snake),
        MethodNaming::Proto => proto_name.to_string(),
    };
    if RESERVED.contains(&name.as_str()) {
        name.push('_');
    }
    format_ident!("{}", name)
}

fn spec_const_ident(proto_name: &str) -> proc_macro2::Ident {
    format_ident!("{}", proto_name.to_case(Case::UpperSnake))
}

fn type_tokens(path: &str) -> TokenStream {
    path.parse().unwrap_or_else(|_| {
        let ident = format_ident!("{}", path);
        quote! { #ident }
    })
}

/// Emit everything for one service into `buf`.
pub(crate) fn emit_service(service: &ServiceModel, config: &GeneratorConfig, buf: &mut String) {
    let module = format_ident!("{}", service.proto_name.to_case(Case::Snake));
    let full_name = service.full_name();

    // MethodSpec constants are shared by every artifact; path them through
    // whichever runtime crate is enabled.
    let rt: TokenStream = if config.build_server {
        quote! { ::connect_rs_axum }
    } else {
        quote! { ::connect_rs_client }
    };

    let spec_consts: Vec<TokenStream> = service
        .methods
        .iter()
        .map(|method| {
            let const_name = spec_const_ident(&method.proto_name);
            let proto_name = &method.proto_name;
            let kind = match method.kind {
                MethodKind::Unary => quote! { Unary },
                MethodKind::ClientStream => quote! { ClientStream },
                MethodKind::ServerStream => quote! { ServerStream },
                MethodKind::BidiStream => quote! { BidiStream },
            };
            let idempotency = match method.idempotency {
                Idempotency::Unknown => quote! { Unknown },
                Idempotency::NoSideEffects => quote! { NoSideEffects },
                Idempotency::Idempotent => quote! { Idempotent },
            };
            quote! {
                pub const #const_name: #rt::MethodSpec = #rt::MethodSpec::new(
                    #full_name,
                    #proto_name,
                    #rt::core::RpcKind::#kind,
                    #rt::core::IdempotencyLevel::#idempotency,
                );
            }
        })
        .collect();

    let server = if config.build_server {
        emit_server(service, config)
    } else {
        quote! {}
    };
    let client = if config.build_client {
        emit_client(service, config)
    } else {
        quote! {}
    };

    let tokens = quote! {
        pub mod #module {
            #[allow(unused_imports)]
            use super::*;

            #(#spec_consts)*

            #server
            #client
        }
    };
    buf.push_str(&tokens.to_string());
    buf.push('\n');
}

/// The service trait plus the router constructor (the server application).
fn emit_server(service: &ServiceModel, config: &GeneratorConfig) -> TokenStream {
    let trait_name = format_ident!("{}", service.proto_name);
    let router_fn = format_ident!("router");

    let mut trait_items = Vec::new();
    let mut routes = Vec::new();

    for method in &service.methods {
        let name = method_ident(&method.proto_name, config.method_naming);
        let const_name = spec_const_ident(&method.proto_name);
        let input = type_tokens(&method.input_type);
        let output = type_tokens(&method.output_type);
        let path = format!("/{}/{}", service.full_name(), method.proto_name);
        let stream_assoc = format_ident!("{}Stream", method.proto_name);

        match method.kind {
            MethodKind::Unary => {
                trait_items.push(quote! {
                    fn #name(
                        &self,
                        ctx: ::connect_rs_axum::RequestContext,
                        request: #input,
                    ) -> impl ::core::future::Future<
                        Output = Result<#output, ::connect_rs_axum::ConnectError>,
                    > + Send;
                });
                routes.push(quote! {
                    .route(#path, ::connect_rs_axum::handler::unary(#const_name, {
                        let service = service.clone();
                        move |ctx, request| {
                            let service = service.clone();
                            async move { service.#name(ctx, request).await }
                        }
                    }))
                });
            }
            MethodKind::ServerStream => {
                trait_items.push(quote! {
                    type #stream_assoc: ::connect_rs_axum::futures::Stream<
                        Item = Result<#output, ::connect_rs_axum::ConnectError>,
                    > + Send + 'static;

                    fn #name(
                        &self,
                        ctx: ::connect_rs_axum::RequestContext,
                        request: #input,
                    ) -> impl ::core::future::Future<
                        Output = Result<Self::#stream_assoc, ::connect_rs_axum::ConnectError>,
                    > + Send;
                });
                routes.push(quote! {
                    .route(#path, ::connect_rs_axum::handler::server_stream(#const_name, {
                        let service = service.clone();
                        move |ctx, request| {
                            let service = service.clone();
                            async move { service.#name(ctx, request).await }
                        }
                    }))
                });
            }
            MethodKind::ClientStream => {
                trait_items.push(quote! {
                    fn #name(
                        &self,
                        ctx: ::connect_rs_axum::RequestContext,
                        requests: ::connect_rs_axum::Streaming<#input>,
                    ) -> impl ::core::future::Future<
                        Output = Result<#output, ::connect_rs_axum::ConnectError>,
                    > + Send;
                });
                routes.push(quote! {
                    .route(#path, ::connect_rs_axum::handler::client_stream(#const_name, {
                        let service = service.clone();
                        move |ctx, requests| {
                            let service = service.clone();
                            async move { service.#name(ctx, requests).await }
                        }
                    }))
                });
            }
            MethodKind::BidiStream => {
                trait_items.push(quote! {
                    type #stream_assoc: ::connect_rs_axum::futures::Stream<
                        Item = Result<#output, ::connect_rs_axum::ConnectError>,
                    > + Send + 'static;

                    fn #name(
                        &self,
                        ctx: ::connect_rs_axum::RequestContext,
                        requests: ::connect_rs_axum::Streaming<#input>,
                    ) -> impl ::core::future::Future<
                        Output = Result<Self::#stream_assoc, ::connect_rs_axum::ConnectError>,
                    > + Send;
                });
                routes.push(quote! {
                    .route(#path, ::connect_rs_axum::handler::bidi_stream(#const_name, {
                        let service = service.clone();
                        move |ctx, requests| {
                            let service = service.clone();
                            async move { service.#name(ctx, requests).await }
                        }
                    }))
                });
            }
        }
    }

    quote! {
        /// Per-method handlers for this service.
        pub trait #trait_name: Send + Sync + 'static {
            #(#trait_items)*
        }

        /// Build a router serving `service` under the service's full name.
        pub fn #router_fn<S: #trait_name>(service: ::std::sync::Arc<S>) -> ::axum::Router {
            ::axum::Router::new()
                #(#routes)*
        }
    }
}

/// The async client and the blocking client.
fn emit_client(service: &ServiceModel, config: &GeneratorConfig) -> TokenStream {
    let client_name = format_ident!("{}Client", service.proto_name);
    let blocking_name = format_ident!("{}BlockingClient", service.proto_name);

    let mut async_methods = Vec::new();
    let mut blocking_methods = Vec::new();

    for method in &service.methods {
        let name = method_ident(&method.proto_name, config.method_naming);
        let const_name = spec_const_ident(&method.proto_name);
        let input = type_tokens(&method.input_type);
        let output = type_tokens(&method.output_type);

        match method.kind {
            MethodKind::Unary => {
                async_methods.push(quote! {
                    pub async fn #name(
                        &self,
                        request: &#input,
                        options: ::connect_rs_client::CallOptions,
                    ) -> Result<
                        ::connect_rs_client::CallResponse<#output>,
                        ::connect_rs_client::ClientError,
                    > {
                        self.inner.call_unary(#const_name, request, options).await
                    }
                });
                blocking_methods.push(quote! {
                    pub fn #name(
                        &self,
                        request: &#input,
                        options: ::connect_rs_client::CallOptions,
                    ) -> Result<
                        ::connect_rs_client::CallResponse<#output>,
                        ::connect_rs_client::ClientError,
                    > {
                        self.inner.call_unary(#const_name, request, options)
                    }
                });

                if method.idempotency == Idempotency::NoSideEffects {
                    let get_name = format_ident!("{}_get", name);
                    async_methods.push(quote! {
                        /// Issue this call as an HTTP GET, permitted because
                        /// the method is marked `no_side_effects`.
                        pub async fn #get_name(
                            &self,
                            request: &#input,
                            options: ::connect_rs_client::CallOptions,
                        ) -> Result<
                            ::connect_rs_client::CallResponse<#output>,
                            ::connect_rs_client::ClientError,
                        > {
                            self.inner
                                .call_unary(#const_name, request, options.use_get(true))
                                .await
                        }
                    });
                }
            }
            MethodKind::ServerStream => {
                async_methods.push(quote! {
                    pub async fn #name(
                        &self,
                        request: &#input,
                        options: ::connect_rs_client::CallOptions,
                    ) -> Result<
                        ::connect_rs_client::Streaming<#output>,
                        ::connect_rs_client::ClientError,
                    > {
                        self.inner.call_server_stream(#const_name, request, options).await
                    }
                });
                blocking_methods.push(quote! {
                    pub fn #name(
                        &self,
                        request: &#input,
                        options: ::connect_rs_client::CallOptions,
                    ) -> Result<Vec<#output>, ::connect_rs_client::ClientError> {
                        self.inner.call_server_stream(#const_name, request, options)
                    }
                });
            }
            MethodKind::ClientStream => {
                async_methods.push(quote! {
                    pub async fn #name<S>(
                        &self,
                        requests: S,
                        options: ::connect_rs_client::CallOptions,
                    ) -> Result<
                        ::connect_rs_client::CallResponse<#output>,
                        ::connect_rs_client::ClientError,
                    >
                    where
                        S: ::connect_rs_client::futures::Stream<Item = #input> + Send + 'static,
                    {
                        self.inner.call_client_stream(#const_name, requests, options).await
                    }
                });
            }
            MethodKind::BidiStream => {
                async_methods.push(quote! {
                    pub async fn #name<S>(
                        &self,
                        requests: S,
                        options: ::connect_rs_client::CallOptions,
                    ) -> Result<
                        ::connect_rs_client::Streaming<#output>,
                        ::connect_rs_client::ClientError,
                    >
                    where
                        S: ::connect_rs_client::futures::Stream<Item = #input> + Send + 'static,
                    {
                        self.inner.call_bidi_stream(#const_name, requests, options).await
                    }
                });
            }
        }
    }

    quote! {
        #[derive(Clone)]
        pub struct #client_name {
            inner: ::connect_rs_client::ConnectClient,
        }

        impl #client_name {
            pub fn new(inner: ::connect_rs_client::ConnectClient) -> Self {
                Self { inner }
            }

            #(#async_methods)*
        }

        /// Blocking stub covering the unary and server-streaming methods.
        pub struct #blocking_name {
            inner: ::connect_rs_client::BlockingClient,
        }

        impl #blocking_name {
            pub fn new(inner: ::connect_rs_client::BlockingClient) -> Self {
                Self { inner }
            }

            #(#blocking_methods)*
        }
    }
}

/// The `prost-build` driver: fills the model from `prost_build::Service`.
pub struct ConnectServiceGenerator {
    config: GeneratorConfig,
}

impl ConnectServiceGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }
}

impl prost_build::ServiceGenerator for ConnectServiceGenerator {
    fn generate(&mut self, service: prost_build::Service, buf: &mut String) {
        let model = ServiceModel {
            package: service.package.clone(),
            proto_name: service.proto_name.clone(),
            methods: service
                .methods
                .iter()
                .map(|method| MethodModel {
                    proto_name: method.proto_name.clone(),
                    input_type: method.input_type.clone(),
                    output_type: method.output_type.clone(),
                    kind: match (method.client_streaming, method.server_streaming) {
                        (false, false) => MethodKind::Unary,
                        (true, false) => MethodKind::ClientStream,
                        (false, true) => MethodKind::ServerStream,
                        (true, true) => MethodKind::BidiStream,
                    },
                    idempotency: match method.options.idempotency_level() {
                        prost_types::method_options::IdempotencyLevel::NoSideEffects => {
                            Idempotency::NoSideEffects
                        }
                        prost_types::method_options::IdempotencyLevel::Idempotent => {
                            Idempotency::Idempotent
                        }
                        prost_types::method_options::IdempotencyLevel::IdempotencyUnknown => {
                            Idempotency::Unknown
                        }
                    },
                })
                .collect(),
        };
        emit_service(&model, &self.config, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TypePathMode;

    fn sample_service() -> ServiceModel {
        ServiceModel {
            package: "greet.v1".into(),
            proto_name: "GreetService".into(),
            methods: vec![
                MethodModel {
                    proto_name: "Greet".into(),
                    input_type: "GreetRequest".into(),
                    output_type: "GreetResponse".into(),
                    kind: MethodKind::Unary,
                    idempotency: Idempotency::Unknown,
                },
                MethodModel {
                    proto_name: "GetGreeting".into(),
                    input_type: "GetGreetingRequest".into(),
                    output_type: "GreetResponse".into(),
                    kind: MethodKind::Unary,
                    idempotency: Idempotency::NoSideEffects,
                },
                MethodModel {
                    proto_name: "Watch".into(),
                    input_type: "WatchRequest".into(),
                    output_type: "WatchEvent".into(),
                    kind: MethodKind::ServerStream,
                    idempotency: Idempotency::Unknown,
                },
                MethodModel {
                    proto_name: "Chat".into(),
                    input_type: "ChatMessage".into(),
                    output_type: "ChatMessage".into(),
                    kind: MethodKind::BidiStream,
                    idempotency: Idempotency::Unknown,
                },
            ],
        }
    }

    fn generate(config: &GeneratorConfig) -> String {
        let mut buf = String::new();
        emit_service(&sample_service(), config, &mut buf);
        buf
    }

    #[test]
    fn emits_module_trait_router_and_clients() {
        let out = generate(&GeneratorConfig::default());
        assert!(out.contains("pub mod greet_service"));
        assert!(out.contains("pub trait GreetService"));
        assert!(out.contains("pub fn router"));
        assert!(out.contains("pub struct GreetServiceClient"));
        assert!(out.contains("pub struct GreetServiceBlockingClient"));
        assert!(out.contains("\"/greet.v1.GreetService/Greet\""));
    }

    #[test]
    fn spec_constants_carry_kind_and_idempotency() {
        let out = generate(&GeneratorConfig::default());
        assert!(out.contains("RpcKind :: ServerStream"));
        assert!(out.contains("IdempotencyLevel :: NoSideEffects"));
        assert!(out.contains("\"greet.v1.GreetService\""));
    }

    #[test]
    fn no_side_effects_methods_get_a_get_variant() {
        let out = generate(&GeneratorConfig::default());
        assert!(out.contains("get_greeting_get"));
        assert!(!out.contains("greet_get"));
    }

    #[test]
    fn client_only_output_skips_server_artifacts() {
        let config = GeneratorConfig {
            build_server: false,
            ..GeneratorConfig::default()
        };
        let out = generate(&config);
        assert!(!out.contains("pub trait GreetService"));
        assert!(out.contains("pub struct GreetServiceClient"));
        assert!(out.contains(":: connect_rs_client :: MethodSpec"));
    }

    #[test]
    fn proto_naming_keeps_original_case() {
        let config = GeneratorConfig {
            method_naming: MethodNaming::Proto,
            ..GeneratorConfig::default()
        };
        let out = generate(&config);
        assert!(out.contains("fn Greet"));
    }

    #[test]
    fn reserved_method_names_get_trailing_underscore() {
        let ident = method_ident("Type", MethodNaming::Snake);
        assert_eq!(ident.to_string(), "type_");
        let ident = method_ident("Loop", MethodNaming::Snake);
        assert_eq!(ident.to_string(), "loop_");
        let ident = method_ident("Greet", MethodNaming::Snake);
        assert_eq!(ident.to_string(), "greet");
    }

    #[test]
    fn generation_is_deterministic() {
        let config = GeneratorConfig {
            type_path: TypePathMode::Absolute("crate::pb".into()),
            ..GeneratorConfig::default()
        };
        assert_eq!(generate(&config), generate(&config));
    }
}
