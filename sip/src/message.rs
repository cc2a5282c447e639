use crate::conn::TransportType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::str;
use std::str::FromStr;
use strum_macros;
use strum_macros::EnumString;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader as AsyncBufReader};

pub const SIP_VERSION: &str = "SIP/2.0";

lazy_static::lazy_static! {
    static ref URI_REGEX: regex::Regex = regex::Regex::new(
            [
                r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9\+\-\.]*):",
                r"(?:(?P<user>[a-zA-Z0-9\-_\.!\~\*\#'\(\)&\+\$%]+)@)?",
                r"(?:(?P<host>[^;\?:]*)(?::(?P<port>[\d]+))?)",
                r"(?:;(?P<params>.*))?$",
            ]
            .concat()
            .as_ref(),
        ).unwrap();

    static ref ADDRESS_REGEX: [regex::Regex; 3] = [
        regex::Regex::new(r#"^(?P<name>[a-zA-Z0-9\-\._\+\~ \t]*)<(?P<uri>[^>]+)>(?:;(?P<params>.*))?"#).unwrap(),
        regex::Regex::new(r#"^(?:"(?P<name>[^"]+)")[ \t]*<(?P<uri>[^>]+)>(?:;(?P<params>.*))?"#).unwrap(),
        regex::Regex::new(r#"^[ \t]*(?P<name>)(?P<uri>[^;]+)(?:;(?P<params>.*))?"#).unwrap(),
    ];

    static ref CREDENTIALS_PARAM_REGEX: regex::Regex = regex::Regex::new(
        r#"(?P<key>[a-zA-Z][a-zA-Z0-9\-_]*)\s*=\s*(?:"(?P<quoted>[^"]*)"|(?P<bare>[^,\s]+))"#,
    ).unwrap();
}

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Serialize,
    Deserialize,
)]
pub enum Method {
    REGISTER,
    INVITE,
    ACK,
    CANCEL,
    BYE,
    MESSAGE,
    SUBSCRIBE,
    NOTIFY,
    INFO,
    OPTIONS,
}

impl Default for Method {
    fn default() -> Self {
        Method::MESSAGE
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid start line: {0}")]
    InvalidStartLine(String),
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("invalid {0} header")]
    InvalidHeader(&'static str),
    #[error("invalid via header")]
    InvalidVia,
    #[error("invalid uri")]
    InvalidUri,
    #[error("invalid address")]
    InvalidAddress,
    #[error("message exceeds the maximum allowed size")]
    LargeMessage,
    #[error("truncated message")]
    Truncated,
    #[error("message is not valid utf-8")]
    InvalidEncoding,
}

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Cseq {
    pub seq: u32,
    pub method: Method,
}

impl FromStr for Cseq {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(2, ' ').collect();
        if parts.len() != 2 {
            return Err(MessageError::InvalidHeader("CSeq"));
        }
        let seq = parts[0]
            .parse::<u32>()
            .map_err(|_| MessageError::InvalidHeader("CSeq"))?;
        let method = Method::from_str(parts[1].trim())
            .map_err(|_| MessageError::InvalidHeader("CSeq"))?;
        Ok(Cseq { seq, method })
    }
}

impl Display for Cseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Via {
    pub transport: TransportType,
    pub host: String,
    pub port: Option<u16>,
    pub branch: String,
    pub received: Option<String>,
    pub rport: Option<u16>,
    pub params: IndexMap<String, Option<String>>,
}

impl FromStr for Via {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut via = Via::default();
        let parts: Vec<&str> = s.splitn(2, ' ').collect();
        if parts.len() != 2 {
            return Err(MessageError::InvalidVia);
        }

        let proto = parts[0];
        let addr = parts[1];

        let parts: Vec<&str> = proto.split('/').collect();
        if parts.len() != 3 {
            return Err(MessageError::InvalidVia);
        }
        via.transport = TransportType::from_str(&parts[2].to_lowercase())
            .map_err(|_| MessageError::InvalidVia)?;

        let uri = Uri::from_str(&["sip:", addr].concat())?;
        via.host = uri.host;
        via.port = uri.port;
        for (key, value) in uri.params {
            match key.as_ref() {
                "branch" => via.branch = value.unwrap_or_default(),
                "received" => via.received = value,
                "rport" => via.rport = value.and_then(|r| r.parse::<u16>().ok()),
                _ => {
                    via.params.insert(key, value);
                }
            }
        }

        Ok(via)
    }
}

impl Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SIP/2.0/{} {}",
            self.transport.to_string().to_uppercase(),
            self.host
        )?;

        if let Some(ref p) = self.port {
            write!(f, ":{}", p)?;
        }

        if let Some(ref r) = self.received {
            write!(f, ";received={}", r)?;
        }

        if let Some(ref r) = self.rport {
            write!(f, ";rport={}", r)?;
        }

        write!(f, ";branch={}", self.branch)?;

        for (key, val) in self.params.iter() {
            match val {
                Some(inner) => write!(f, ";{}={}", key, inner)?,
                None => write!(f, ";{}", key)?,
            }
        }

        Ok(())
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: IndexMap<String, Option<String>>,
}

impl FromStr for Uri {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut uri = Uri::default();
        let caps = URI_REGEX.captures(s).ok_or(MessageError::InvalidUri)?;
        if let Some(m) = caps.name("scheme") {
            uri.scheme = m.as_str().to_string();
        }
        if let Some(m) = caps.name("user") {
            uri.user = Some(m.as_str().to_string());
        }
        if let Some(m) = caps.name("host") {
            uri.host = m.as_str().to_string();
        }
        if let Some(m) = caps.name("port") {
            uri.port = Some(
                m.as_str()
                    .parse::<u16>()
                    .map_err(|_| MessageError::InvalidUri)?,
            );
        }

        let mut params = IndexMap::new();
        if let Some(m) = caps.name("params") {
            for p in m.as_str().split(';') {
                let mut parts = p.splitn(2, '=');
                let name = parts.next().unwrap_or("");
                if name.is_empty() {
                    continue;
                }
                let value = parts.next().map(|i| i.to_string());
                params.insert(name.to_string(), value);
            }
        }
        uri.params = params;

        Ok(uri)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:",
            if !self.scheme.is_empty() {
                &self.scheme
            } else {
                "sip"
            }
        )?;
        let user = match self.user.as_ref() {
            Some(u) => [u.as_ref(), "@"].concat(),
            None => "".to_string(),
        };
        write!(f, "{}{}", user, self.host)?;

        if let Some(ref p) = self.port {
            write!(f, ":{}", p)?;
        }

        for (key, val) in self.params.iter() {
            f.write_str(";")?;
            f.write_str(key.as_str())?;
            match val {
                Some(inner) => {
                    f.write_str("=")?;
                    f.write_str(inner.as_str())?;
                }
                None => (),
            };
        }

        Ok(())
    }
}

impl Uri {
    pub fn get_port(&self) -> u16 {
        self.port.unwrap_or(5060)
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Address {
    pub display_name: String,
    pub uri: Uri,
    pub tag: Option<String>,
    pub params: IndexMap<String, Option<String>>,
}

impl FromStr for Address {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for re in ADDRESS_REGEX.iter() {
            let mut captures = re.captures_iter(s);
            if let Some(cap) = captures.next() {
                if cap.len() != 4 {
                    continue;
                }

                let display_name = cap
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                let uri = Uri::from_str(
                    cap.get(2).ok_or(MessageError::InvalidUri)?.as_str(),
                )?;

                let mut address = Address {
                    display_name,
                    uri,
                    tag: None,
                    params: IndexMap::new(),
                };

                if let Some(m) = cap.get(3) {
                    for part in m.as_str().split(';') {
                        let mut split = part.splitn(2, '=');
                        let name = split.next().unwrap_or("");
                        if name.is_empty() {
                            continue;
                        }
                        let value = split.next().map(|i| i.to_string());
                        match name {
                            "tag" => address.tag = value,
                            _ => {
                                address.params.insert(name.to_string(), value);
                            }
                        }
                    }
                }

                return Ok(address);
            }
        }
        Err(MessageError::InvalidAddress)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.display_name.is_empty() {
            write!(f, r#""{}" "#, self.display_name)?;
        }

        write!(f, "<{}>", self.uri)?;

        if let Some(ref t) = self.tag {
            write!(f, ";tag={}", t)?;
        }

        for (key, val) in self.params.iter() {
            match val {
                Some(inner) => write!(f, ";{}={}", key, inner)?,
                None => write!(f, ";{}", key)?,
            }
        }

        Ok(())
    }
}

/// Credential headers as GB28181 peers send them: a scheme token (`Digest`,
/// `Capability`, `Asymmetric`) followed by a comma- or space-separated
/// `key="value"` list. The engine only parses and re-serializes these;
/// digest computation lives elsewhere in the platform.
#[derive(Default, Clone, Debug)]
pub struct Credentials {
    pub scheme: String,
    pub params: IndexMap<String, String>,
}

impl FromStr for Credentials {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = match s.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest),
            None => (s, ""),
        };
        if scheme.is_empty() || scheme.contains('=') {
            return Err(MessageError::InvalidHeader("credentials"));
        }

        let mut params = IndexMap::new();
        for cap in CREDENTIALS_PARAM_REGEX.captures_iter(rest) {
            let key = cap.name("key").map(|m| m.as_str()).unwrap_or("");
            let value = cap
                .name("quoted")
                .or_else(|| cap.name("bare"))
                .map(|m| m.as_str())
                .unwrap_or("");
            params.insert(key.to_string(), value.to_string());
        }

        Ok(Credentials {
            scheme: scheme.to_string(),
            params,
        })
    }
}

impl Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.scheme)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i == 0 {
                write!(f, " ")?;
            } else {
                write!(f, ",")?;
            }
            write!(f, r#"{}="{}""#, key, value)?;
        }
        Ok(())
    }
}

/// Tracks which required headers actually appeared on the wire, so absence
/// can be told apart from a present-but-empty value.
#[derive(Default)]
struct SeenHeaders {
    from: bool,
    to: bool,
    call_id: bool,
    cseq: bool,
    content_length: bool,
}

#[derive(Default, Clone, Debug)]
pub struct Message {
    pub method: Option<Method>,
    pub request_uri: Option<Uri>,
    pub code: Option<u16>,
    pub status: Option<String>,

    pub via: Vec<Via>,
    pub from: Address,
    pub to: Address,
    pub call_id: String,
    pub cseq: Cseq,
    pub contact: Option<Address>,
    pub max_forwards: Option<u32>,
    pub expires: Option<u32>,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub authorization: Option<Credentials>,
    pub www_authenticate: Option<Credentials>,

    /// Unrecognized headers, keyed by upper-cased name, last write wins.
    pub headers: IndexMap<String, String>,

    /// Set while decoding from the declared Content-Length; encoding always
    /// recomputes the header from `body`.
    pub content_length: Option<usize>,

    pub body: Vec<u8>,
}

impl FromStr for Message {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Message, MessageError> {
        let (msg, _) = Message::decode(s.as_bytes(), s.len())?;
        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write_head(f)?;
        f.write_str(&String::from_utf8_lossy(&self.body))
    }
}

impl Message {
    pub fn is_request(&self) -> bool {
        self.request_uri.is_some()
    }

    pub fn top_branch(&self) -> Option<&str> {
        self.via.first().map(|v| v.branch.as_str())
    }

    /// The transaction-relevant method: the request method for requests, the
    /// CSeq method for responses.
    pub fn tx_method(&self) -> Method {
        match self.method.as_ref() {
            Some(m) if self.is_request() => m.clone(),
            _ => self.cseq.method.clone(),
        }
    }

    /// Builds a response to this request, echoing the headers the peer
    /// matches on.
    pub fn reply(&self, code: u16, status: &str) -> Message {
        Message {
            code: Some(code),
            status: Some(status.to_string()),
            via: self.via.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            call_id: self.call_id.clone(),
            cseq: self.cseq.clone(),
            ..Default::default()
        }
    }

    /// Serializes the message. Content-Length is recomputed from the body,
    /// never taken from `content_length`.
    pub fn encode(&self) -> Vec<u8> {
        let mut head = String::with_capacity(512 + self.body.len());
        // writing into a String cannot fail
        let _ = self.write_head(&mut head);
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    fn write_head(&self, f: &mut impl fmt::Write) -> fmt::Result {
        if self.is_request() {
            write!(
                f,
                "{} {} {}\r\n",
                self.method.as_ref().unwrap_or(&Method::MESSAGE),
                self.request_uri.as_ref().unwrap_or(&Uri::default()),
                SIP_VERSION,
            )?;
        } else {
            write!(
                f,
                "{} {} {}\r\n",
                SIP_VERSION,
                self.code.unwrap_or(0),
                self.status.as_deref().unwrap_or(""),
            )?;
        }

        for via in self.via.iter() {
            write!(f, "Via: {}\r\n", via)?;
        }

        if let Some(ref i) = self.max_forwards {
            write!(f, "Max-Forwards: {}\r\n", i)?;
        }

        if let Some(ref i) = self.contact {
            write!(f, "Contact: {}\r\n", i)?;
        }

        write!(f, "To: {}\r\n", self.to)?;
        write!(f, "From: {}\r\n", self.from)?;
        write!(f, "Call-ID: {}\r\n", self.call_id)?;
        write!(f, "CSeq: {}\r\n", self.cseq)?;

        if let Some(ref i) = self.www_authenticate {
            write!(f, "WWW-Authenticate: {}\r\n", i)?;
        }

        if let Some(ref i) = self.authorization {
            write!(f, "Authorization: {}\r\n", i)?;
        }

        if let Some(ref i) = self.expires {
            write!(f, "Expires: {}\r\n", i)?;
        }

        if let Some(ref i) = self.content_type {
            write!(f, "Content-Type: {}\r\n", i)?;
        }

        if let Some(ref i) = self.user_agent {
            write!(f, "User-Agent: {}\r\n", i)?;
        }

        for (name, value) in self.headers.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }

        write!(f, "Content-Length: {}\r\n\r\n", self.body.len())
    }

    /// Decodes one message from the front of `buf`, returning it together
    /// with the number of bytes consumed so a datagram carrying several
    /// back-to-back messages can be walked. Every consumed line and the
    /// declared body length count against `max_bytes`; going over fails with
    /// `LargeMessage` no matter how the peer shaped the excess.
    pub fn decode(
        buf: &[u8],
        max_bytes: usize,
    ) -> Result<(Message, usize), MessageError> {
        let mut pos = 0usize;
        let mut budget = max_bytes as i64;

        // keepalive CRLFs may precede the start line
        let mut line = Self::next_line(buf, &mut pos, &mut budget)?;
        while line.is_empty() {
            line = Self::next_line(buf, &mut pos, &mut budget)?;
        }

        let mut msg = Message::default();
        Self::parse_start_line(line, &mut msg)?;

        let mut seen = SeenHeaders::default();
        loop {
            let line = Self::next_line(buf, &mut pos, &mut budget)?;
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            Self::parse_header(&mut msg, &mut seen, name.trim(), value.trim())?;
        }

        let content_length = Self::check_required(&msg, &seen)?;

        budget -= content_length as i64;
        if budget < 0 {
            return Err(MessageError::LargeMessage);
        }
        if buf.len() - pos < content_length {
            return Err(MessageError::Truncated);
        }
        msg.body = buf[pos..pos + content_length].to_vec();
        pos += content_length;

        Ok((msg, pos))
    }

    /// Stream variant of [`decode`](Self::decode) used by the TCP driver;
    /// the same budget accounting applies per message.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut AsyncBufReader<R>,
        max_bytes: usize,
    ) -> anyhow::Result<Message> {
        let mut budget = max_bytes as i64;
        let mut line = String::new();

        while line.trim_end().is_empty() {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                anyhow::bail!("connection closed");
            }
            budget -= n as i64;
            if budget < 0 {
                return Err(MessageError::LargeMessage.into());
            }
        }

        let mut msg = Message::default();
        Self::parse_start_line(line.trim_end(), &mut msg)?;

        let mut seen = SeenHeaders::default();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(MessageError::Truncated.into());
            }
            budget -= n as i64;
            if budget < 0 {
                return Err(MessageError::LargeMessage.into());
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            let Some((name, value)) = trimmed.split_once(':') else {
                continue;
            };
            Self::parse_header(&mut msg, &mut seen, name.trim(), value.trim())?;
        }

        let content_length = Self::check_required(&msg, &seen)?;

        budget -= content_length as i64;
        if budget < 0 {
            return Err(MessageError::LargeMessage.into());
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        msg.body = body;

        Ok(msg)
    }

    fn next_line<'a>(
        buf: &'a [u8],
        pos: &mut usize,
        budget: &mut i64,
    ) -> Result<&'a str, MessageError> {
        let rest = &buf[*pos..];
        let nl = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(MessageError::Truncated)?;
        *budget -= (nl + 1) as i64;
        if *budget < 0 {
            return Err(MessageError::LargeMessage);
        }
        *pos += nl + 1;
        let mut line = &rest[..nl];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        str::from_utf8(line).map_err(|_| MessageError::InvalidEncoding)
    }

    fn parse_start_line(line: &str, msg: &mut Message) -> Result<(), MessageError> {
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() != 3 {
            return Err(MessageError::InvalidStartLine(line.to_string()));
        }
        if parts[0] == SIP_VERSION {
            msg.code = Some(
                parts[1]
                    .parse::<u16>()
                    .map_err(|_| MessageError::InvalidStartLine(line.to_string()))?,
            );
            msg.status = Some(parts[2].to_string());
        } else {
            // request form: the version literal sits in the trailing slot
            if parts[1] == SIP_VERSION || parts[2] != SIP_VERSION {
                return Err(MessageError::InvalidStartLine(line.to_string()));
            }
            msg.method = Some(
                Method::from_str(parts[0])
                    .map_err(|_| MessageError::InvalidStartLine(line.to_string()))?,
            );
            msg.request_uri = Some(Uri::from_str(parts[1])?);
        }
        Ok(())
    }

    fn parse_header(
        msg: &mut Message,
        seen: &mut SeenHeaders,
        name: &str,
        value: &str,
    ) -> Result<(), MessageError> {
        match name.to_lowercase().as_ref() {
            "v" | "via" => {
                for part in value.split(',') {
                    msg.via.push(Via::from_str(part.trim())?);
                }
            }
            "f" | "from" => {
                msg.from = Address::from_str(value)
                    .map_err(|_| MessageError::InvalidHeader("From"))?;
                seen.from = true;
            }
            "t" | "to" => {
                msg.to = Address::from_str(value)
                    .map_err(|_| MessageError::InvalidHeader("To"))?;
                seen.to = true;
            }
            "i" | "call-id" => {
                msg.call_id = value.to_string();
                seen.call_id = true;
            }
            "cseq" => {
                msg.cseq = Cseq::from_str(value)?;
                seen.cseq = true;
            }
            "l" | "content-length" => {
                msg.content_length = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| MessageError::InvalidHeader("Content-Length"))?,
                );
                seen.content_length = true;
            }
            "m" | "contact" => {
                msg.contact = Address::from_str(value).ok();
            }
            "max-forwards" => {
                msg.max_forwards = value.parse::<u32>().ok();
            }
            "expires" => {
                msg.expires = value.parse::<u32>().ok();
            }
            "c" | "content-type" => {
                msg.content_type = Some(value.to_string());
            }
            "user-agent" => {
                msg.user_agent = Some(value.to_string());
            }
            "authorization" => {
                msg.authorization = Credentials::from_str(value).ok();
            }
            "www-authenticate" => {
                msg.www_authenticate = Credentials::from_str(value).ok();
            }
            _ => {
                msg.headers.insert(name.to_uppercase(), value.to_string());
            }
        }
        Ok(())
    }

    fn check_required(
        msg: &Message,
        seen: &SeenHeaders,
    ) -> Result<usize, MessageError> {
        if msg.via.is_empty() {
            return Err(MessageError::MissingHeader("Via"));
        }
        if !seen.from {
            return Err(MessageError::MissingHeader("From"));
        }
        if !seen.to {
            return Err(MessageError::MissingHeader("To"));
        }
        if !seen.call_id {
            return Err(MessageError::MissingHeader("Call-ID"));
        }
        if !seen.cseq {
            return Err(MessageError::MissingHeader("CSeq"));
        }
        if !seen.content_length {
            return Err(MessageError::MissingHeader("Content-Length"));
        }
        Ok(msg.content_length.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn via_from_string() {
        let s = "SIP/2.0/UDP 10.0.0.2;branch=z9hG4bKtestbranch";
        let via = Via::from_str(s).unwrap();
        assert_eq!(s, via.to_string());

        let s = "SIP/2.0/UDP 10.0.0.2:5080;received=10.0.0.3;rport=5090;branch=z9hG4bKtestbranch";
        let via = Via::from_str(s).unwrap();
        assert_eq!(s, via.to_string());
        assert_eq!("10.0.0.3", via.received.unwrap());
        assert_eq!(5090, via.rport.unwrap());

        let s = "SIP/2.0/TCP 10.0.0.2:5080;branch=z9hG4bKx";
        let via = Via::from_str(s).unwrap();
        assert_eq!(TransportType::Tcp, via.transport);
    }

    #[test]
    fn via_to_string() {
        let via = Via {
            host: "10.0.0.2".to_string(),
            port: Some(5080),
            branch: "z9hG4bKtestbranch".to_string(),
            ..Default::default()
        };
        assert_eq!(
            "SIP/2.0/UDP 10.0.0.2:5080;branch=z9hG4bKtestbranch",
            via.to_string()
        );
    }

    #[test]
    fn address_from_string() {
        let s = r#""34020000001320000001" <sip:34020000001320000001@3402000000>;tag=887865341"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!(s, address.to_string());
        assert_eq!("887865341", address.tag.unwrap_or_default());

        let s = r#"<sip:34020000002000000001@192.168.1.10:5060>"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!(s, address.to_string());

        let s = r#"sip:alice@example.net"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!("<sip:alice@example.net>", address.to_string());
    }

    #[test]
    fn uri_from_string() {
        let s = "sip:34020000001320000001@192.168.1.20:5060";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!("sip".to_string(), uri.scheme);
        assert_eq!(Some("34020000001320000001".to_string()), uri.user);
        assert_eq!("192.168.1.20".to_string(), uri.host);
        assert_eq!(Some(5060), uri.port);
        assert_eq!(s, uri.to_string());

        let s = "sip:example.com";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(s, uri.to_string());
        assert_eq!(5060, uri.get_port());

        let s = "sip:user@example.com;user=phone";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(s, uri.to_string());
    }

    #[test]
    fn credentials_from_string() {
        let s = r#"Digest username="34020000001320000001", realm="3402000000", nonce="44010a0e", uri="sip:34020000002000000001@3402000000", response="5ee6ce3792fd9c17e67e11b0e6a080f9", algorithm=MD5"#;
        let auth = Credentials::from_str(s).unwrap();
        assert_eq!("Digest", auth.scheme);
        assert_eq!("3402000000", auth.params["realm"]);
        assert_eq!("44010a0e", auth.params["nonce"]);
        assert_eq!("MD5", auth.params["algorithm"]);

        let s = r#"Capability algorithm="A:RSA/ECB/PKCS1,SHA1" keyversion="1""#;
        let auth = Credentials::from_str(s).unwrap();
        assert_eq!("Capability", auth.scheme);
        assert_eq!("A:RSA/ECB/PKCS1,SHA1", auth.params["algorithm"]);
        assert_eq!("1", auth.params["keyversion"]);

        assert!(Credentials::from_str("").is_err());
    }

    fn keepalive_body() -> String {
        [
            "<?xml version=\"1.0\"?>",
            "<Notify>",
            "<CmdType>Keepalive</CmdType>",
            "<SN>42</SN>",
            "<DeviceID>34020000001320000001</DeviceID>",
            "<Status>OK</Status>",
            "</Notify>",
            "",
        ]
        .join("\r\n")
    }

    fn keepalive_message() -> String {
        let body = keepalive_body();
        [
            "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0".to_string(),
            "Via: SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bKnashds7".to_string(),
            "Max-Forwards: 70".to_string(),
            "To: <sip:34020000002000000001@3402000000>".to_string(),
            "From: <sip:34020000001320000001@3402000000>;tag=812392".to_string(),
            "Call-ID: a84b4c76e66710".to_string(),
            "CSeq: 20 MESSAGE".to_string(),
            "Content-Type: Application/MANSCDP+xml".to_string(),
            format!("Content-Length: {}", body.len()),
            "".to_string(),
            body,
        ]
        .join("\r\n")
    }

    #[test]
    fn message_round_trip() {
        let msg_str = keepalive_message();
        let msg = Message::from_str(&msg_str).unwrap();
        assert!(msg.is_request());
        assert_eq!(Some(Method::MESSAGE), msg.method);
        assert_eq!("a84b4c76e66710", msg.call_id);
        assert_eq!(20, msg.cseq.seq);
        assert_eq!(keepalive_body().as_bytes(), &msg.body[..]);
        assert_eq!(msg_str.as_bytes(), &msg.encode()[..]);

        let resp_str = [
            "SIP/2.0 401 Unauthorized",
            "Via: SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bKnashds7",
            "To: <sip:34020000001320000001@3402000000>;tag=887865341",
            "From: <sip:34020000001320000001@3402000000>;tag=812392",
            "Call-ID: a84b4c76e66710",
            "CSeq: 1 REGISTER",
            r#"WWW-Authenticate: Digest realm="3402000000",nonce="44010a0e""#,
            "Content-Length: 0",
            "",
            "",
        ]
        .join("\r\n");
        let msg = Message::from_str(&resp_str).unwrap();
        assert!(!msg.is_request());
        assert_eq!(Some(401), msg.code);
        assert_eq!(Method::REGISTER, msg.tx_method());
        assert_eq!(
            "44010a0e",
            msg.www_authenticate.as_ref().unwrap().params["nonce"]
        );
        assert_eq!(resp_str.as_bytes(), &msg.encode()[..]);
    }

    #[test]
    fn compact_headers_and_folded_via() {
        let msg_str = [
            "MESSAGE sip:a@b SIP/2.0",
            "v: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKone,SIP/2.0/UDP 10.0.0.2;branch=z9hG4bKtwo",
            "t: <sip:a@b>",
            "f: <sip:c@d>;tag=x",
            "i: compactcall",
            "CSeq: 1 MESSAGE",
            "l: 0",
            "",
            "",
        ]
        .join("\r\n");
        let msg = Message::from_str(&msg_str).unwrap();
        assert_eq!(2, msg.via.len());
        assert_eq!("z9hG4bKone", msg.via[0].branch);
        assert_eq!("z9hG4bKtwo", msg.via[1].branch);
        assert_eq!("compactcall", msg.call_id);
    }

    #[test]
    fn open_bag_last_write_wins() {
        let msg_str = [
            "MESSAGE sip:a@b SIP/2.0",
            "Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKone",
            "To: <sip:a@b>",
            "From: <sip:c@d>;tag=x",
            "Call-ID: bagcall",
            "CSeq: 1 MESSAGE",
            "Subject: first",
            "subject: second",
            "Content-Length: 0",
            "",
            "",
        ]
        .join("\r\n");
        let msg = Message::from_str(&msg_str).unwrap();
        assert_eq!("second", msg.headers["SUBJECT"]);
        assert_eq!(1, msg.headers.len());
    }

    #[test]
    fn missing_headers_are_distinct() {
        let build = |skip: &str| -> String {
            let mut lines = vec!["MESSAGE sip:a@b SIP/2.0".to_string()];
            if skip != "Via" {
                lines.push("Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKone".into());
            }
            if skip != "To" {
                lines.push("To: <sip:a@b>".into());
            }
            if skip != "From" {
                lines.push("From: <sip:c@d>;tag=x".into());
            }
            if skip != "Call-ID" {
                lines.push("Call-ID: missingcall".into());
            }
            if skip != "CSeq" {
                lines.push("CSeq: 1 MESSAGE".into());
            }
            if skip != "Content-Length" {
                lines.push("Content-Length: 0".into());
            }
            lines.push("".into());
            lines.push("".into());
            lines.join("\r\n")
        };

        for name in ["Via", "To", "From", "Call-ID", "CSeq", "Content-Length"] {
            match Message::from_str(&build(name)) {
                Err(MessageError::MissingHeader(h)) => assert_eq!(name, h),
                other => panic!("expected missing {name}, got {other:?}"),
            }
        }
    }

    #[test]
    fn malformed_start_line() {
        let msg_str = "HELLO\r\n\r\n";
        match Message::decode(msg_str.as_bytes(), 1024) {
            Err(MessageError::InvalidStartLine(line)) => assert_eq!("HELLO", line),
            other => panic!("expected start line error, got {other:?}"),
        }

        // version in the middle slot is not a request
        let msg_str = "INVITE SIP/2.0 sip:a@b\r\n\r\n";
        assert!(matches!(
            Message::decode(msg_str.as_bytes(), 1024),
            Err(MessageError::InvalidStartLine(_))
        ));
    }

    #[test]
    fn size_boundary() {
        let msg_str = keepalive_message();
        let exact = msg_str.len();

        let (msg, consumed) = Message::decode(msg_str.as_bytes(), exact).unwrap();
        assert_eq!(exact, consumed);
        assert_eq!(Some(Method::MESSAGE), msg.method);

        // one byte under the wire size fails while reading the body
        assert!(matches!(
            Message::decode(msg_str.as_bytes(), exact - 1),
            Err(MessageError::LargeMessage)
        ));

        // budget smaller than the start line fails there
        assert!(matches!(
            Message::decode(msg_str.as_bytes(), 8),
            Err(MessageError::LargeMessage)
        ));

        // budget exhausted inside the header block
        assert!(matches!(
            Message::decode(msg_str.as_bytes(), 120),
            Err(MessageError::LargeMessage)
        ));
    }

    #[test]
    fn back_to_back_messages_in_one_buffer() {
        let one = keepalive_message();
        let two = [one.as_str(), one.as_str()].concat();
        let (first, used) = Message::decode(two.as_bytes(), one.len()).unwrap();
        assert_eq!(one.len(), used);
        let (second, used2) =
            Message::decode(&two.as_bytes()[used..], one.len()).unwrap();
        assert_eq!(one.len(), used2);
        assert_eq!(first.call_id, second.call_id);
    }

    #[tokio::test]
    async fn read_from_stream() {
        let msg_str = keepalive_message();
        let double = [msg_str.as_str(), msg_str.as_str()].concat();
        let mut reader = AsyncBufReader::new(double.as_bytes());
        let first = Message::read_from(&mut reader, 65535).await.unwrap();
        let second = Message::read_from(&mut reader, 65535).await.unwrap();
        assert_eq!(first.call_id, second.call_id);
        assert_eq!(first.encode(), second.encode());
        assert!(Message::read_from(&mut reader, 65535).await.is_err());
    }
}
