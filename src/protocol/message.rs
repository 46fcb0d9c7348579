use std::fmt;

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const PARAMS_DELIMITER: char = '?';
pub(crate) const RECIPIENT_DELIMITER: char = '&';
pub(crate) const LENGTH_PREFIX: &str = "Length=";

pub const RES_TABLE: &str = "res_table";
pub const HISTORY: &str = "history";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Push,
    Post,
    Get,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Push => "PUSH",
            Method::Post => "POST",
            Method::Get => "GET",
        }
    }

    /// Whether messages of this method carry a `Length=` line and a body.
    pub fn has_body(&self) -> bool {
        matches!(self, Method::Push | Method::Post)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message exchanged with the bus gateway.
///
/// `content` is present exactly when the method carries a body; the constructors
/// keep that invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    method: Method,
    command: String,
    params: Option<String>,
    recipient_id: Option<String>,
    content: Option<Vec<u8>>,
}

impl Message {
    pub fn get(command: impl Into<String>) -> Self {
        Self::new(Method::Get, command, None)
    }

    pub fn push(command: impl Into<String>, content: Vec<u8>) -> Self {
        Self::new(Method::Push, command, Some(content))
    }

    pub fn post(command: impl Into<String>, content: Vec<u8>) -> Self {
        Self::new(Method::Post, command, Some(content))
    }

    pub(crate) fn new(
        method: Method,
        command: impl Into<String>,
        content: Option<Vec<u8>>,
    ) -> Self {
        debug_assert_eq!(method.has_body(), content.is_some());
        Self {
            method,
            command: command.into(),
            params: None,
            recipient_id: None,
            content,
        }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }

    pub fn with_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> Option<&str> {
        self.params.as_deref()
    }

    pub fn recipient_id(&self) -> Option<&str> {
        self.recipient_id.as_deref()
    }

    pub fn content(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    /// Renders the header line, including the trailing CRLF.
    pub fn header(&self) -> String {
        let mut header = format!("{} {}", self.method, self.command);
        if let Some(params) = &self.params {
            header.push(PARAMS_DELIMITER);
            header.push_str(params);
        }
        if let Some(recipient_id) = &self.recipient_id {
            header.push(RECIPIENT_DELIMITER);
            header.push_str(recipient_id);
        }
        header.push_str("\r\n");
        header
    }

    /// Renders the full frame as it goes on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header().into_bytes();
        if let Some(content) = &self.content {
            out.extend_from_slice(format!("{LENGTH_PREFIX}{}", content.len()).as_bytes());
            out.extend_from_slice(CRLF);
            out.extend_from_slice(content);
            out.extend_from_slice(CRLF);
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method={} command={}", self.method, self.command)?;
        if let Some(params) = &self.params {
            write!(f, " params={params}")?;
        }
        if let Some(recipient_id) = &self.recipient_id {
            write!(f, " id={recipient_id}")?;
        }
        if let Some(content) = &self.content {
            write!(f, " content={} bytes", content.len())?;
        }
        Ok(())
    }
}

/// Announcement sent right after connecting, telling the gateway which pushes
/// and requests this client wants routed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub push: Vec<String>,
    pub get: Vec<String>,
    pub identity: String,
    /// Follow the announcement with a `GET res_table` so the gateway re-sends
    /// its current readings.
    pub refresh_on_connect: bool,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            push: vec![RES_TABLE.to_string()],
            get: vec![HISTORY.to_string()],
            identity: "py_miner,pm1".to_string(),
            refresh_on_connect: false,
        }
    }
}

impl Subscription {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {}|{} {}{RECIPIENT_DELIMITER}{}\r\n",
            Method::Push,
            self.push.join(","),
            Method::Get,
            self.get.join(","),
            self.identity
        )
        .into_bytes();
        if self.refresh_on_connect {
            out.extend_from_slice(&Message::get(RES_TABLE).encode());
        }
        out
    }
}
