//! Protobuf message definitions for the nesting service.

/// A virtual machine as reported by the service.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VirtualMachine {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub addr: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitRequest {
    /// Opaque backend configuration.
    #[prost(bytes = "vec", tag = "1")]
    pub config: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShutdownRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShutdownResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRequest {
    /// Image name to instantiate.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// Optional slot the new VM occupies.
    #[prost(int32, optional, tag = "2")]
    pub slot: ::core::option::Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateResponse {
    #[prost(message, optional, tag = "1")]
    pub vm: ::core::option::Option<VirtualMachine>,
    /// Id of the VM deleted to make room in the requested slot.
    #[prost(string, optional, tag = "2")]
    pub stomped_vm_id: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRequest {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListResponse {
    #[prost(message, repeated, tag = "1")]
    pub vms: ::prost::alloc::vec::Vec<VirtualMachine>,
}

/// Error classification carried back to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unspecified = 0,
    AlreadyInitialized = 1,
    NotInitialized = 2,
    ResourceExhausted = 3,
    NotFound = 4,
    Driver = 5,
    Cancelled = 6,
    DeadlineExceeded = 7,
    InvalidRequest = 8,
}

impl ErrorCode {
    /// Stable snake_case name, used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unspecified => "unspecified",
            ErrorCode::AlreadyInitialized => "already_initialized",
            ErrorCode::NotInitialized => "not_initialized",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Driver => "driver",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::InvalidRequest => "invalid_request",
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorStatus {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

/// Envelope for every call sent to the service.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    /// Echoed back in the matching response.
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    /// Deadline for the call in milliseconds. Zero means no deadline.
    #[prost(uint64, tag = "2")]
    pub timeout_ms: u64,
    #[prost(oneof = "request::Call", tags = "3, 4, 5, 6, 7")]
    pub call: ::core::option::Option<request::Call>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Call {
        #[prost(message, tag = "3")]
        Init(super::InitRequest),
        #[prost(message, tag = "4")]
        Shutdown(super::ShutdownRequest),
        #[prost(message, tag = "5")]
        Create(super::CreateRequest),
        #[prost(message, tag = "6")]
        Delete(super::DeleteRequest),
        #[prost(message, tag = "7")]
        List(super::ListRequest),
    }

    impl Call {
        /// Method name, used in logs.
        pub fn method(&self) -> &'static str {
            match self {
                Call::Init(_) => "init",
                Call::Shutdown(_) => "shutdown",
                Call::Create(_) => "create",
                Call::Delete(_) => "delete",
                Call::List(_) => "list",
            }
        }
    }
}

/// Envelope for every reply sent by the service.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(oneof = "response::Outcome", tags = "2, 3, 4, 5, 6, 7")]
    pub outcome: ::core::option::Option<response::Outcome>,
}

pub mod response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "2")]
        Init(super::InitResponse),
        #[prost(message, tag = "3")]
        Shutdown(super::ShutdownResponse),
        #[prost(message, tag = "4")]
        Create(super::CreateResponse),
        #[prost(message, tag = "5")]
        Delete(super::DeleteResponse),
        #[prost(message, tag = "6")]
        List(super::ListResponse),
        #[prost(message, tag = "7")]
        Error(super::ErrorStatus),
    }
}

impl Request {
    pub fn new(request_id: impl Into<String>, call: request::Call) -> Self {
        Self {
            request_id: request_id.into(),
            timeout_ms: 0,
            call: Some(call),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

impl Response {
    pub fn ok(request_id: impl Into<String>, outcome: response::Outcome) -> Self {
        Self {
            request_id: request_id.into(),
            outcome: Some(outcome),
        }
    }

    pub fn error(request_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            outcome: Some(response::Outcome::Error(ErrorStatus {
                code: code as i32,
                message: message.into(),
            })),
        }
    }
}
