/// Per-message context carried through the middleware chain. Spec.md
/// deliberately leaves structured logging/tracing as an external
/// collaborator; this is the minimal carrier the middleware chain needs to
/// pass trace/user identity and a scoped logger target downstream, without
/// pulling in a tracing crate.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub trace_id: String,
    pub user_id: String,
}

impl MessageContext {
    pub fn from_header(header: &crate::message::Header) -> Self {
        MessageContext {
            trace_id: header.trace_id.clone(),
            user_id: header.user_id.clone(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }
}
