//! Resource declarations and the naming convention both roles share.
//!
//! A resource `widget` always exposes the four CRUD operations:
//!
//! | operation | method | path      | target          |
//! |-----------|--------|-----------|-----------------|
//! | read      | GET    | `/widget` | `widget.read`   |
//! | create    | POST   | `/widget` | `widget.create` |
//! | update    | PUT    | `/widget` | `widget.update` |
//! | delete    | DELETE | `/widget` | `widget.delete` |
//!
//! Custom operations are declared as `"<route>:<method>"` and map to
//! `/<resource>/<route>` and `<resource>.<route>`. Replies for every operation
//! of a resource travel on `<resource>.replyTo`.

use std::fmt;
use std::str::FromStr;

/// Suffix of the per-resource reply channel.
pub const REPLY_SUFFIX: &str = "replyTo";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("invalid resource name '{0}'")]
    InvalidName(String),
    #[error("invalid operation spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
    #[error("unknown transport method '{0}'")]
    UnknownMethod(String),
    #[error("operation '{operation}' declared twice on resource '{resource}'")]
    DuplicateOperation { resource: String, operation: String },
}

/// An operation a resource exposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Custom(String),
}

impl Operation {
    pub const CRUD: [Operation; 4] = [
        Operation::Read,
        Operation::Create,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn name(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Custom(name) => name,
        }
    }

    /// CRUD names map to their variants; anything else is custom.
    pub fn from_name(name: &str) -> Self {
        match name {
            "create" => Self::Create,
            "read" => Self::Read,
            "update" => Self::Update,
            "delete" => Self::Delete,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }

    fn crud_method(&self) -> Option<TransportMethod> {
        match self {
            Self::Create => Some(TransportMethod::Post),
            Self::Read => Some(TransportMethod::Get),
            Self::Update => Some(TransportMethod::Put),
            Self::Delete => Some(TransportMethod::Delete),
            Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Synchronous transport verb an operation is served on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl TransportMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for TransportMethod {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            "put" => Ok(Self::Put),
            "delete" => Ok(Self::Delete),
            _ => Err(ResourceError::UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for TransportMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `"<route>:<method>"` custom operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    pub route: String,
    pub method: TransportMethod,
}

impl FromStr for OperationSpec {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ResourceError::InvalidSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let (route, method) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected <route>:<method>"))?;
        if !is_valid_name(route) {
            return Err(invalid("route must be a single non-empty word"));
        }
        let method = method.parse::<TransportMethod>()?;

        Ok(Self {
            route: route.to_string(),
            method,
        })
    }
}

/// One operation of a declared resource, with its derived names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredOperation {
    pub operation: Operation,
    pub method: TransportMethod,
    /// Synchronous transport path, e.g. `/widget` or `/widget/doSomething`.
    pub path: String,
    /// Exchange and queue name, e.g. `widget.read`.
    pub target: String,
}

/// A resource as declared on either role. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDecl {
    name: String,
    operations: Vec<DeclaredOperation>,
}

impl ResourceDecl {
    /// Resource exposing the default CRUD operations only.
    pub fn new(name: impl Into<String>) -> Result<Self, ResourceError> {
        Self::with_operations(name, std::iter::empty::<&str>())
    }

    /// Resource exposing CRUD plus the given `"<route>:<method>"` operations.
    pub fn with_operations<I, S>(name: impl Into<String>, specs: I) -> Result<Self, ResourceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(ResourceError::InvalidName(name));
        }

        let mut operations: Vec<DeclaredOperation> = Operation::CRUD
            .iter()
            .filter_map(|op| {
                op.crud_method().map(|method| DeclaredOperation {
                    operation: op.clone(),
                    method,
                    path: format!("/{name}"),
                    target: target_name(&name, op),
                })
            })
            .collect();

        for raw in specs {
            let spec: OperationSpec = raw.as_ref().parse()?;
            if spec.route == REPLY_SUFFIX {
                return Err(ResourceError::InvalidSpec {
                    spec: raw.as_ref().to_string(),
                    reason: format!("'{REPLY_SUFFIX}' is reserved for the reply channel"),
                });
            }
            let operation = Operation::from_name(&spec.route);
            if operations.iter().any(|d| d.operation == operation) {
                return Err(ResourceError::DuplicateOperation {
                    resource: name,
                    operation: spec.route,
                });
            }
            operations.push(DeclaredOperation {
                method: spec.method,
                path: format!("/{name}/{}", spec.route),
                target: target_name(&name, &operation),
                operation,
            });
        }

        Ok(Self { name, operations })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &[DeclaredOperation] {
        &self.operations
    }

    pub fn operation(&self, operation: &Operation) -> Option<&DeclaredOperation> {
        self.operations.iter().find(|d| &d.operation == operation)
    }

    pub fn custom_operations(&self) -> impl Iterator<Item = &DeclaredOperation> {
        self.operations.iter().filter(|d| d.operation.is_custom())
    }

    pub fn reply_channel(&self) -> String {
        reply_channel(&self.name)
    }
}

/// Exchange/queue name for an operation: `<resource>.<operation>`.
pub fn target_name(resource: &str, operation: &Operation) -> String {
    format!("{resource}.{}", operation.name())
}

/// Exchange/queue name replies for `resource` travel on.
pub fn reply_channel(resource: &str) -> String {
    format!("{resource}.{REPLY_SUFFIX}")
}

/// Names end up as routing-key words and URL path segments.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| matches!(c, '.' | '/' | '#' | '*' | ':') || c.is_whitespace())
}
