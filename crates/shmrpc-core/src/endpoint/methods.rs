//! Method registration table.
//!
//! A server dispatches by name through a table built once at start-up.
//! Each entry records the handler and the codecs of its parameters and
//! result; [`MethodSignature`] constants give clients the same view.

use super::remote_error::{HandlerError, RemoteErrorKind};
use crate::channel::Request;
use crate::codec::CodecKind;
use crate::config::EndpointConfig;
use crate::error::{Result, ShmRpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

type BoxedHandler = Box<dyn Fn(&[u8]) -> HandlerResult<Vec<u8>> + Send + Sync>;

/// Name and codecs of a method, shared by server and client code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: &'static str,
    pub params: CodecKind,
    pub returns: CodecKind,
}

impl MethodSignature {
    pub const fn new(name: &'static str, params: CodecKind, returns: CodecKind) -> Self {
        Self {
            name,
            params,
            returns,
        }
    }

    /// Bytes in, bytes out.
    pub const fn raw(name: &'static str) -> Self {
        Self::new(name, CodecKind::Raw, CodecKind::Raw)
    }

    pub fn is_raw(&self) -> bool {
        self.params == CodecKind::Raw && self.returns == CodecKind::Raw
    }
}

/// Built-in echo used to check a connection end to end.
pub const HEARTBEAT: MethodSignature = MethodSignature::raw(EndpointConfig::HEARTBEAT_METHOD);

struct Registration {
    name: String,
    params: CodecKind,
    returns: CodecKind,
    typed: bool,
    handler: BoxedHandler,
}

/// Describes one registered method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub params: CodecKind,
    pub returns: CodecKind,
}

/// Collects registrations; validated by [`MethodTableBuilder::build`].
#[derive(Default)]
pub struct MethodTableBuilder {
    registrations: Vec<Registration>,
    allow_insecure: bool,
}

impl MethodTableBuilder {
    /// Permit codecs that can rebuild arbitrary object graphs (bincode).
    pub fn allow_insecure_codecs(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    /// Register a handler that works on raw bytes.
    pub fn raw<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[u8]) -> HandlerResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.registrations.push(Registration {
            name: name.into(),
            params: CodecKind::Raw,
            returns: CodecKind::Raw,
            typed: false,
            handler: Box::new(handler),
        });
        self
    }

    /// Register a handler whose arguments and result go through codecs.
    ///
    /// Multiple arguments are passed as a tuple.
    pub fn typed<A, R, F>(
        mut self,
        name: impl Into<String>,
        params: CodecKind,
        returns: CodecKind,
        handler: F,
    ) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> HandlerResult<R> + Send + Sync + 'static,
    {
        let wrapped = move |bytes: &[u8]| -> HandlerResult<Vec<u8>> {
            let args: A = params.loads(bytes).map_err(|e| {
                HandlerError::type_error(format!("cannot decode arguments: {}", e))
            })?;
            let result = handler(args)?;
            returns
                .dumps(&result)
                .map_err(|e| HandlerError::type_error(format!("cannot encode result: {}", e)))
        };
        self.registrations.push(Registration {
            name: name.into(),
            params,
            returns,
            typed: true,
            handler: Box::new(wrapped),
        });
        self
    }

    /// Register a typed handler under a shared signature.
    pub fn method<A, R, F>(self, signature: &MethodSignature, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> HandlerResult<R> + Send + Sync + 'static,
    {
        self.typed(signature.name, signature.params, signature.returns, handler)
    }

    /// Validate every registration and freeze the table.
    ///
    /// Rejects duplicate or malformed names, typed handlers declared with the
    /// raw codec, and insecure codecs unless explicitly allowed. The
    /// `heartbeat` echo is added automatically.
    pub fn build(self) -> Result<MethodTable> {
        let mut methods = HashMap::new();
        let heartbeat = Registration {
            name: HEARTBEAT.name.to_string(),
            params: CodecKind::Raw,
            returns: CodecKind::Raw,
            typed: false,
            handler: Box::new(|bytes: &[u8]| Ok(bytes.to_vec())),
        };

        for registration in std::iter::once(heartbeat).chain(self.registrations) {
            Request::new(&registration.name, &[])?;

            if registration.typed
                && (registration.params == CodecKind::Raw || registration.returns == CodecKind::Raw)
            {
                return Err(ShmRpcError::Codec {
                    codec: CodecKind::Raw.name(),
                    message: format!(
                        "method {} is typed but declares the raw codec; register it with raw()",
                        registration.name
                    ),
                });
            }

            if !self.allow_insecure {
                for codec in [registration.params, registration.returns] {
                    if codec.is_insecure() {
                        return Err(ShmRpcError::InsecureCodec {
                            method: registration.name,
                            codec: codec.name(),
                        });
                    }
                }
            }

            if methods.contains_key(&registration.name) {
                return Err(ShmRpcError::DuplicateMethod {
                    method: registration.name,
                });
            }
            methods.insert(registration.name.clone(), registration);
        }

        Ok(MethodTable { methods })
    }
}

/// Immutable name-to-handler table used by server worker threads.
pub struct MethodTable {
    methods: HashMap<String, Registration>,
}

impl MethodTable {
    pub fn builder() -> MethodTableBuilder {
        MethodTableBuilder::default()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered methods sorted by name.
    pub fn methods(&self) -> Vec<MethodInfo> {
        let mut infos: Vec<MethodInfo> = self
            .methods
            .values()
            .map(|r| MethodInfo {
                name: r.name.clone(),
                params: r.params,
                returns: r.returns,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Run a method. Handler errors and panics come back as `HandlerError`.
    pub fn dispatch(&self, method: &str, args: &[u8]) -> HandlerResult<Vec<u8>> {
        let Some(registration) = self.methods.get(method) else {
            return Err(HandlerError::new(
                RemoteErrorKind::MethodNotFound,
                format!("no method named {:?}", method),
            ));
        };

        match panic::catch_unwind(AssertUnwindSafe(|| (registration.handler)(args))) {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::new(
                RemoteErrorKind::Panic,
                panic_message(payload.as_ref()),
            )),
        }
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
