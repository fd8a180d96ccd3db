//! HTTP request head sniffing for proxied payloads.
//!
//! Only the request line and the `Host` header are looked at; anything that
//! doesn't look like an HTTP/1.x request yields `None`.

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Request line and host of a plaintext HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHead<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub host: Option<&'a str>,
}

impl<'a> RequestHead<'a> {
    /// Parse the head of `payload`.
    pub fn parse(payload: &'a str) -> Option<Self> {
        let mut lines = payload.lines();
        let mut parts = lines.next()?.split_ascii_whitespace();

        let method = parts.next()?;
        let target = parts.next()?;
        let version = parts.next()?;
        if !METHODS.contains(&method) || !version.starts_with("HTTP/") {
            return None;
        }

        let host = lines
            .take_while(|line| !line.trim().is_empty())
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("host")
                    .then(|| value.trim())
                    .filter(|v| !v.is_empty())
            });

        Some(Self { method, target, host })
    }

    /// The request target when it names its destination by itself:
    /// absolute-form URLs and CONNECT authorities.
    pub fn absolute_target(&self) -> Option<&'a str> {
        let is_absolute = self.method == "CONNECT"
            || self.target.starts_with("http://")
            || self.target.starts_with("https://");
        is_absolute.then_some(self.target)
    }
}
