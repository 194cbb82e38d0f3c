use core::fmt::Display;

pub use anyhow::{Context, Error, Result};

/// Everything a request can fail with, across all of the wire protocols.
/// The JSON protocols carry the numeric `rpc_code`, the notification bus
/// carries the 32 bit `code`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    // parsing
    #[error("malformed stream")]
    BadStream,
    #[error("invalid hash")]
    InvalidHash,
    #[error("invalid number")]
    InvalidNumber,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("missing version")]
    MissingVersion,
    #[error("missing target")]
    MissingTarget,
    #[error("missing hash")]
    MissingHash,
    #[error("missing height")]
    MissingHeight,
    #[error("missing position")]
    MissingPosition,
    #[error("missing id type")]
    MissingIdType,
    #[error("missing type id")]
    MissingTypeId,
    #[error("invalid target")]
    InvalidTarget,
    #[error("invalid component")]
    InvalidComponent,
    #[error("invalid subcomponent")]
    InvalidSubcomponent,
    #[error("invalid id type")]
    InvalidIdType,
    #[error("extraneous path segment")]
    ExtraSegment,
    #[error("empty path")]
    EmptyPath,

    // admission
    #[error("host not allowed")]
    BadHost,
    #[error("origin not allowed")]
    ForbiddenOrigin,
    #[error("connection/subscription pool is filled")]
    PoolFilled,
    #[error("not implemented")]
    NotImplemented,

    // transport
    #[error("channel stopped")]
    ChannelStopped,
    #[error("channel timed out")]
    ChannelTimeout,
    #[error("channel overflow")]
    ChannelOverflow,
    #[error("allocation failure")]
    BadAlloc,
    #[error("service stopped")]
    ServiceStopped,

    // protocol
    #[error("not found")]
    NotFound,
    #[error("server error")]
    ServerError,
    #[error("method not found")]
    MethodNotFound,
}

impl GatewayError {
    /// Wire code placed on bus notifications (0 is success, which has no
    /// error variant here).
    pub fn code(self) -> u32 {
        match self {
            GatewayError::BadStream => 1,
            GatewayError::InvalidHash => 2,
            GatewayError::InvalidNumber => 3,
            GatewayError::InvalidArgument => 4,
            GatewayError::MissingVersion => 5,
            GatewayError::MissingTarget => 6,
            GatewayError::MissingHash => 7,
            GatewayError::MissingHeight => 8,
            GatewayError::MissingPosition => 9,
            GatewayError::MissingIdType => 10,
            GatewayError::MissingTypeId => 11,
            GatewayError::InvalidTarget => 12,
            GatewayError::InvalidComponent => 13,
            GatewayError::InvalidSubcomponent => 14,
            GatewayError::InvalidIdType => 15,
            GatewayError::ExtraSegment => 16,
            GatewayError::EmptyPath => 17,
            GatewayError::BadHost => 20,
            GatewayError::ForbiddenOrigin => 21,
            GatewayError::PoolFilled => 22,
            GatewayError::NotImplemented => 23,
            GatewayError::ChannelStopped => 30,
            GatewayError::ChannelTimeout => 31,
            GatewayError::ChannelOverflow => 32,
            GatewayError::BadAlloc => 33,
            GatewayError::ServiceStopped => 34,
            GatewayError::NotFound => 40,
            GatewayError::ServerError => 41,
            GatewayError::MethodNotFound => 42,
        }
    }

    /// JSON-RPC error code.
    pub fn rpc_code(self) -> i32 {
        match self {
            GatewayError::MethodNotFound | GatewayError::NotImplemented => -32601,
            GatewayError::InvalidArgument
            | GatewayError::InvalidHash
            | GatewayError::InvalidNumber => -32602,
            GatewayError::BadStream | GatewayError::EmptyPath => -32700,
            GatewayError::NotFound => -32004,
            _ => -32603,
        }
    }

    /// HTTP status the REST surfaces answer with.
    pub fn http_status(self) -> u16 {
        match self {
            GatewayError::NotFound | GatewayError::MethodNotFound => 404,
            GatewayError::BadHost | GatewayError::ForbiddenOrigin => 403,
            GatewayError::PoolFilled => 503,
            GatewayError::NotImplemented => 501,
            GatewayError::ServerError
            | GatewayError::BadAlloc
            | GatewayError::ServiceStopped
            | GatewayError::ChannelStopped
            | GatewayError::ChannelTimeout
            | GatewayError::ChannelOverflow => 500,
            _ => 400,
        }
    }

    /// A `bad_stream` on a stream protocol closes the channel; everything
    /// else leaves it open.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            GatewayError::BadStream
                | GatewayError::ChannelStopped
                | GatewayError::ChannelOverflow
                | GatewayError::ServiceStopped
        )
    }
}

pub trait OptionExt<T> {
    fn or_err<D>(self, context: D) -> Result<T>
    where
        D: Display + Send + Sync + 'static;

    fn req(self) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_err<D>(self, context: D) -> Result<T>
    where
        D: Display + Send + Sync + 'static,
    {
        self.context(context)
    }

    fn req(self) -> Result<T> {
        self.context("missing required option")
    }
}

pub fn fmt_error_chain(err: &Error) -> String {
    err.chain()
        .map(|e| e.to_string())
        .collect::<Vec<String>>()
        .join(": ")
}

/// The gateway error behind an anyhow chain, when one is there.
pub fn gateway_error(err: &Error) -> Option<GatewayError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<GatewayError>())
        .copied()
}
