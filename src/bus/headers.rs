//! Outbound header construction.

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Local};

use super::logger::{BusEvent, BusLogger};
use crate::envelope::{headers, Headers};
use crate::message::MessageDescriptor;

/// Source of the `SendingHost` header.
pub trait HostResolver: Send + Sync {
    fn hostname(&self) -> io::Result<String>;
}

/// Resolves the local machine's host name.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostResolver for SystemHost {
    fn hostname(&self) -> io::Result<String> {
        hostname::get()?.into_string().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "host name is not valid UTF-8")
        })
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Builds the header set for `send` and `publish`.
#[derive(Clone)]
pub struct HeaderBuilder {
    host: Arc<dyn HostResolver>,
    clock: Clock,
}

impl Default for HeaderBuilder {
    fn default() -> Self {
        Self {
            host: Arc::new(SystemHost),
            clock: Arc::new(Local::now),
        }
    }
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host_resolver(mut self, host: Arc<dyn HostResolver>) -> Self {
        self.host = host;
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Local> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Headers for a message of type `descriptor`. `destination` is set for
    /// point-to-point sends only. The timestamp is taken on every call; a
    /// host name lookup failure is logged and the header left out.
    pub fn build(
        &self,
        descriptor: MessageDescriptor,
        destination: Option<&str>,
        logger: &dyn BusLogger,
    ) -> Headers {
        let mut h = Headers::with_capacity(5);
        h.insert(headers::MESSAGE_NAME.to_string(), descriptor.name.to_string());
        h.insert(
            headers::MESSAGE_FULL_NAME.to_string(),
            descriptor.full_name.to_string(),
        );
        h.insert(
            headers::TIME_SENT.to_string(),
            (self.clock)().format(headers::TIME_SENT_FORMAT).to_string(),
        );

        if let Some(destination) = destination {
            h.insert(headers::DESTINATION.to_string(), destination.to_string());
        }

        match self.host.hostname() {
            Ok(host) => {
                h.insert(headers::SENDING_HOST.to_string(), host);
            }
            Err(e) => logger.log(&BusEvent::HostnameUnavailable {
                error: &e.to_string(),
            }),
        }

        h
    }
}
