// REGISTER Digest 鉴权（设备侧）
// 收到 401 后根据 WWW-Authenticate 挑战计算 Authorization

use std::collections::HashMap;

/// 平台下发的 Digest 挑战
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// 解析 WWW-Authenticate 头部
    pub fn parse(value: &str) -> Option<Self> {
        let params = parse_digest_params(value)?;
        Some(Self {
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce: params.get("nonce").cloned()?,
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
        })
    }

    /// 生成 Authorization 头部值
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let response = compute_digest_response(username, &self.realm, password, method, uri, &self.nonce);

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, self.realm, self.nonce, uri, response
        );
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        value
    }
}

/// 解析 Digest 头部为键值对
fn parse_digest_params(value: &str) -> Option<HashMap<String, String>> {
    let rest = value.trim().strip_prefix("Digest").unwrap_or(value).trim();

    let map: HashMap<String, String> = rest
        .split(',')
        .filter_map(|part| {
            let (key, val) = part.trim().split_once('=')?;
            Some((key.trim().to_ascii_lowercase(), val.trim().trim_matches('"').to_string()))
        })
        .collect();

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// 计算 HTTP Digest 响应（RFC 2617，不使用 qop）
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="3402000000", nonce="a1b2c3", algorithm=MD5, opaque="xyz""#,
        )
        .unwrap();

        assert_eq!(challenge.realm, "3402000000");
        assert_eq!(challenge.nonce, "a1b2c3");
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
    }

    #[test]
    fn test_challenge_without_nonce_is_rejected() {
        assert!(DigestChallenge::parse(r#"Digest realm="3402000000""#).is_none());
    }

    #[test]
    fn test_rfc2617_example_response() {
        // RFC 2617 第 3.5 节示例去掉 qop 后的计算结果
        let ha1 = format!("{:x}", md5::compute("Mufasa:testrealm@host.com:Circle Of Life"));
        let ha2 = format!("{:x}", md5::compute("GET:/dir/index.html"));
        let expected = format!(
            "{:x}",
            md5::compute(format!("{}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{}", ha1, ha2))
        );

        let actual = compute_digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
        );
        assert_eq!(actual, expected);
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");
    }

    #[test]
    fn test_authorization_header() {
        let challenge = DigestChallenge::parse(r#"Digest realm="3402000000", nonce="n1""#).unwrap();
        let header = challenge.authorization("34020000001320000001", "12345678", "REGISTER", "sip:34020000002000000001@3402000000");

        assert!(header.starts_with("Digest username=\"34020000001320000001\""));
        assert!(header.contains("nonce=\"n1\""));
        assert!(header.contains("uri=\"sip:34020000002000000001@3402000000\""));
        assert!(!header.contains("opaque"));
    }
}
