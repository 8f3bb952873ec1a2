use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// AMQP reply codes used by the broker when it refuses a method.
#[rustfmt::skip]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
pub enum ReplyCode {
    Success,
    AccessRefused,
    NotFound,
    ResourceLocked,
    PreconditionFailed,
    FrameError,
    ChannelError,
    NotAllowed,
    InternalError,
}

impl ReplyCode {
    pub fn value(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::AccessRefused => 403,
            Self::NotFound => 404,
            Self::ResourceLocked => 405,
            Self::PreconditionFailed => 406,
            Self::FrameError => 501,
            Self::ChannelError => 504,
            Self::NotAllowed => 530,
            Self::InternalError => 541,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "OK",
            Self::AccessRefused => "ACCESS_REFUSED",
            Self::NotFound => "NOT_FOUND",
            Self::ResourceLocked => "RESOURCE_LOCKED",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::FrameError => "FRAME_ERROR",
            Self::ChannelError => "CHANNEL_ERROR",
            Self::NotAllowed => "NOT_ALLOWED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value(), self.name())
    }
}

#[rustfmt::skip]
#[derive(thiserror::Error)]
#[derive(Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection refused: {code} - {text}")]
    Refused { code: ReplyCode, text: String },

    #[error("channel error: {code} - {text}")]
    Channel { code: ReplyCode, text: String },

    #[error("channel is closed")]
    ChannelClosed,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("message was nacked by the broker")]
    Nacked,

    #[error("tls: {0}")]
    Tls(String),

    #[error("{0}")]
    Rustls(#[from] rustls::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("broker is not running")]
    BrokerGone,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_render_like_amqp() {
        assert_eq!(ReplyCode::NotFound.to_string(), "404 NOT_FOUND");
        assert_eq!(ReplyCode::PreconditionFailed.value(), 406);

        let err = Error::Channel {
            code: ReplyCode::ResourceLocked,
            text: "queue 'q' is exclusive".into(),
        };
        assert_eq!(
            err.to_string(),
            "channel error: 405 RESOURCE_LOCKED - queue 'q' is exclusive"
        );
    }
}
