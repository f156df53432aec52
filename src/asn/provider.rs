//! Bulk whois provider backends.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::AsnError;

/// One provider answer for one IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAnswer {
    pub ip: IpAddr,
    pub asn: String,
    pub country: String,
    pub organization: String,
}

/// A service answering bulk ASN lookups. Batch size and pacing are
/// the caller's policy; implementations only execute one request.
#[async_trait]
pub trait AsnProvider: Send + Sync {
    async fn lookup_batch(&self, ips: &[IpAddr]) -> Result<Vec<ProviderAnswer>, AsnError>;
}

/// Team Cymru bulk whois client (TCP/43).
///
/// Query framing:
/// ```text
/// begin
/// verbose
/// 203.0.113.9
/// ...
/// end
/// ```
/// Response rows are `|`-separated:
/// `AS | IP | BGP Prefix | CC | Registry | Allocated | AS Name` in
/// verbose mode, one column less (no prefix) otherwise.
pub struct CymruWhoisProvider {
    host: String,
    port: u16,
    timeout: Duration,
}

impl CymruWhoisProvider {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        CymruWhoisProvider {
            host: host.to_string(),
            port,
            timeout,
        }
    }

    fn build_query(ips: &[IpAddr]) -> String {
        let mut q = String::from("begin\nverbose\n");
        for ip in ips {
            q.push_str(&ip.to_string());
            q.push('\n');
        }
        q.push_str("end\n");
        q
    }

    /// Parse a bulk response body. Malformed rows are skipped, not
    /// errors: one bad line must not discard the rest of the batch.
    pub fn parse_response(body: &str) -> Vec<ProviderAnswer> {
        let mut answers = Vec::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty()
                || line.starts_with("Bulk mode")
                || line.starts_with("Error")
                || line.starts_with('#')
                || line.starts_with("AS ")
                || line.starts_with("AS\t")
                || line.starts_with("AS|")
            {
                continue;
            }
            let parts: Vec<&str> = line.split('|').map(str::trim).collect();
            if parts.len() < 6 {
                continue;
            }
            let asn = parts[0];
            let ip = match IpAddr::from_str(parts[1]) {
                Ok(ip) => ip,
                Err(_) => continue,
            };
            // "NA" is Cymru's no-data marker; the pipeline caches the
            // absence separately, so skip it here.
            if asn.is_empty() || asn == "NA" {
                continue;
            }
            let (country, organization) = if parts.len() >= 7 {
                (parts[3], parts[6])
            } else {
                (parts[2], parts[5])
            };
            answers.push(ProviderAnswer {
                ip,
                asn: asn.to_string(),
                country: country.to_string(),
                organization: organization.to_string(),
            });
        }
        answers
    }

    /// Distinguish "the provider had nothing for us" from "this is
    /// not a whois response at all". The former yields answers (or at
    /// least `NA` rows); the latter must fail the whole batch so its
    /// members stay pending instead of being cached as negatives.
    fn interpret_response(body: &str) -> Result<Vec<ProviderAnswer>, AsnError> {
        let answers = Self::parse_response(body);
        if answers.is_empty() && !body.contains('|') {
            return Err(AsnError::Malformed);
        }
        Ok(answers)
    }
}

#[async_trait]
impl AsnProvider for CymruWhoisProvider {
    async fn lookup_batch(&self, ips: &[IpAddr]) -> Result<Vec<ProviderAnswer>, AsnError> {
        if ips.is_empty() {
            return Ok(Vec::new());
        }

        let addr = (self.host.as_str(), self.port);
        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AsnError::Timeout)??;

        let query = Self::build_query(ips);
        timeout(self.timeout, stream.write_all(query.as_bytes()))
            .await
            .map_err(|_| AsnError::Timeout)??;

        let mut body = String::new();
        timeout(self.timeout, stream.read_to_string(&mut body))
            .await
            .map_err(|_| AsnError::Timeout)??;

        Self::interpret_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query_framing() {
        let ips = vec![
            IpAddr::from_str("203.0.113.9").unwrap(),
            IpAddr::from_str("2001:db8::1").unwrap(),
        ];
        let q = CymruWhoisProvider::build_query(&ips);
        assert_eq!(q, "begin\nverbose\n203.0.113.9\n2001:db8::1\nend\n");
    }

    #[test]
    fn test_parse_verbose_response() {
        let body = "Bulk mode; whois.cymru.com [2026-01-29 12:00:00 +0000]\n\
                    AS      | IP               | BGP Prefix          | CC | Registry | Allocated  | AS Name\n\
                    13335   | 1.1.1.1          | 1.1.1.0/24          | US | arin     | 2010-07-14 | CLOUDFLARENET, US\n";
        let answers = CymruWhoisProvider::parse_response(body);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].asn, "13335");
        assert_eq!(answers[0].ip.to_string(), "1.1.1.1");
        assert_eq!(answers[0].country, "US");
        assert_eq!(answers[0].organization, "CLOUDFLARENET, US");
    }

    #[test]
    fn test_parse_non_verbose_response() {
        let body = "13335 | 1.1.1.1 | US | arin | 2010-07-14 | CLOUDFLARENET, US\n";
        let answers = CymruWhoisProvider::parse_response(body);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].country, "US");
        assert_eq!(answers[0].organization, "CLOUDFLARENET, US");
    }

    #[test]
    fn test_parse_skips_na_and_garbage() {
        let body = "NA | 10.0.0.1 | NA | NA | NA | NA\n\
                    not a pipe row at all\n\
                    64500 | not-an-ip | US | arin | 2020-01-01 | X\n\
                    64500 | 203.0.113.9 | 203.0.113.0/24 | US | arin | 2020-01-01 | EXAMPLE, US\n";
        let answers = CymruWhoisProvider::parse_response(body);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].ip.to_string(), "203.0.113.9");
    }

    #[test]
    fn test_parse_empty_response() {
        assert!(CymruWhoisProvider::parse_response("").is_empty());
    }

    #[test]
    fn test_interpret_rejects_non_whois_body() {
        assert!(matches!(
            CymruWhoisProvider::interpret_response("<html>502 Bad Gateway</html>"),
            Err(AsnError::Malformed)
        ));
        // An all-NA response is a valid answer set, just empty.
        let all_na = "NA | 10.0.0.1 | NA | NA | NA | NA\n";
        assert!(CymruWhoisProvider::interpret_response(all_na).unwrap().is_empty());
    }

    #[test]
    fn test_empty_batch_short_circuits() {
        // No IPs means no connection at all.
        let provider = CymruWhoisProvider::new("whois.invalid", 43, Duration::from_secs(1));
        let answers = tokio_test::block_on(provider.lookup_batch(&[])).unwrap();
        assert!(answers.is_empty());
    }
}
