//! Response cookies. Cookies collect in the response jar and are
//! flushed as one `Set-Cookie` header each, in insertion order, just
//! before header serialization.

use std::time::{Duration, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    max_age: Option<u64>,
    expires: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            max_age: None,
            expires: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Absolute expiry as a unix timestamp. `-1` with a value present
    /// tells the client to delete the cookie.
    pub fn expires(mut self, unix_secs: i64) -> Self {
        self.expires = Some(unix_secs);
        self
    }

    /// Render the full `Set-Cookie` header line, CRLF included.
    pub fn write_header(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"Set-Cookie: ");
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(b'=');
        buf.extend_from_slice(self.value.as_bytes());
        if let Some(domain) = &self.domain {
            buf.extend_from_slice(b"; Domain=");
            buf.extend_from_slice(domain.as_bytes());
        }
        if let Some(path) = &self.path {
            buf.extend_from_slice(b"; Path=");
            buf.extend_from_slice(path.as_bytes());
        }
        if self.secure {
            buf.extend_from_slice(b"; Secure");
        }
        if let Some(max_age) = self.max_age {
            buf.extend_from_slice(b"; Max-Age=");
            let mut fmt = itoa::Buffer::new();
            buf.extend_from_slice(fmt.format(max_age).as_bytes());
        }
        if let Some(expires) = self.expires {
            // Deletion is expressed as an expiry at the epoch.
            let when = if expires < 0 {
                UNIX_EPOCH
            } else {
                UNIX_EPOCH + Duration::from_secs(expires as u64)
            };
            buf.extend_from_slice(b"; Expires=");
            buf.extend_from_slice(httpdate::fmt_http_date(when).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
    }
}

/// Parse a request `Cookie` header into name/value pairs.
pub fn parse_cookie_header(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            let eq = pair.find('=')?;
            let name = pair[..eq].trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), pair[eq + 1..].trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(c: &Cookie) -> String {
        let mut buf = Vec::new();
        c.write_header(&mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn renders_attributes_in_order() {
        let c = Cookie::new("sid", "abc123")
            .domain("example.com")
            .path("/")
            .secure(true)
            .max_age(600);
        assert_eq!(
            render(&c),
            "Set-Cookie: sid=abc123; Domain=example.com; Path=/; Secure; Max-Age=600\r\n"
        );
    }

    #[test]
    fn max_age_and_expires_coexist() {
        let c = Cookie::new("sid", "x").max_age(60).expires(0);
        let line = render(&c);
        assert!(line.contains("Max-Age=60"));
        assert!(line.contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn negative_expires_means_delete() {
        let c = Cookie::new("sid", "gone").expires(-1);
        assert!(render(&c).contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn parses_request_cookie_header() {
        let pairs = parse_cookie_header("a=1; b=two ;c= 3");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }
}
