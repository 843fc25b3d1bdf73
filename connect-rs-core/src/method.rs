//! Static descriptions of RPC methods.

/// The four RPC shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl RpcKind {
    pub fn is_streaming(&self) -> bool {
        !matches!(self, RpcKind::Unary)
    }
}

/// The idempotency level of an RPC method, from the protobuf
/// `idempotency_level` method option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdempotencyLevel {
    /// The method may have side effects; only POST is allowed.
    #[default]
    Unknown,
    /// The method is side-effect free, so clients may issue it as an HTTP
    /// GET and retry it freely.
    NoSideEffects,
    /// Repeated calls have the same side effects as one call.
    Idempotent,
}

/// Static, generator-produced description of one RPC.
///
/// Input and output message types are not carried here; they are bound by the
/// generated stubs as type parameters, which keeps the dispatcher free of any
/// runtime type mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    /// Fully-qualified dotted service name, e.g. `greet.v1.GreetService`.
    pub service: &'static str,
    /// Method name as declared in the proto file.
    pub method: &'static str,
    pub kind: RpcKind,
    pub idempotency: IdempotencyLevel,
}

impl MethodSpec {
    pub const fn new(
        service: &'static str,
        method: &'static str,
        kind: RpcKind,
        idempotency: IdempotencyLevel,
    ) -> Self {
        Self {
            service,
            method,
            kind,
            idempotency,
        }
    }

    /// `service/Method`, the procedure identifier used in logs and
    /// interceptors.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }

    /// The request path under an optional route prefix.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    /// GET is allowed only for side-effect-free unary methods.
    pub fn allows_get(&self) -> bool {
        self.kind == RpcKind::Unary && self.idempotency == IdempotencyLevel::NoSideEffects
    }

    /// The `Allow` header value for this method.
    pub fn allowed_methods(&self) -> &'static str {
        if self.allows_get() { "GET, POST" } else { "POST" }
    }
}
