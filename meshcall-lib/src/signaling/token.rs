use base64::{prelude::BASE64_STANDARD, Engine};
use getset::{CopyGetters, Getters};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Where the conference server lives, as encoded in a join token.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, CopyGetters, Getters)]
pub struct Endpoint {
    #[getset(get = "pub")]
    host: String,
    #[serde(default)]
    #[getset(get_copy = "pub")]
    secure: bool,
}

impl Endpoint {
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.host)
    }
}

pub fn parse_token(token: &str) -> Result<Endpoint> {
    let json = BASE64_STANDARD
        .decode(token.trim())
        .map_err(|err| Error::IllegalArgument(format!("token is not base64: {}", err)))?;
    serde_json::from_slice(&json)
        .map_err(|err| Error::IllegalArgument(format!("malformed token: {}", err)))
}

#[cfg(test)]
pub(crate) fn encode_token(host: &str, secure: bool) -> String {
    BASE64_STANDARD.encode(
        serde_json::json!({ "tokenId": "t1", "host": host, "secure": secure }).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_decodes_to_endpoint() {
        let endpoint = parse_token(&encode_token("conf.example.com:3004", true)).unwrap();
        assert_eq!(endpoint.host(), "conf.example.com:3004");
        assert!(endpoint.secure());
        assert_eq!(endpoint.url(), "https://conf.example.com:3004");
    }

    #[test]
    fn garbage_token_is_an_argument_error() {
        assert!(matches!(
            parse_token("not a token"),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            parse_token(&BASE64_STANDARD.encode("[]")),
            Err(Error::IllegalArgument(_))
        ));
    }
}
