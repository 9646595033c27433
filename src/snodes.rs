//! Service-node discovery.
//!
//! The snode pool is bootstrapped from three well-known seed endpoints,
//! tried strictly in order; the first seed returning a non-empty node list
//! wins. Each seed's X.509 certificate and SHA-256 pins ship with the
//! crate; the seeds terminate TLS with these exact certs, so pinning
//! rather than the web PKI is the trust root when HTTPS is used.

use serde_json::json;
use thiserror::Error;

use crate::swarm::{RawSnode, Snode};
use crate::transport::{FetchError, Request, Transport};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to fetch service nodes from all seeds")]
    AllSeedsFailed,
}

pub struct SeedNode {
    pub host: &'static str,
    /// Base64 SHA-256 pin of the seed's public key.
    pub pubkey256: &'static str,
    /// Colon-separated SHA-256 fingerprint of the certificate.
    pub cert256: &'static str,
    pub cert_pem: &'static str,
}

pub const SEEDS: [SeedNode; 3] = [
    SeedNode {
        host: "seed1.getsession.org",
        pubkey256: "mlYTXvkmIEYcpswANTpnBwlz9Cswi0py/RQKkbdQOZQ=",
        cert256: "36:EA:0B:25:35:37:98:85:51:EE:85:6E:4F:D2:0D:55:01:1E:9C:8B:27:EA:A2:F3:4B:8F:32:A0:BD:F0:4F:2D",
        cert_pem: SEED1_CERT,
    },
    SeedNode {
        host: "seed2.getsession.org",
        pubkey256: "ZuUxe4wopBR83Yy5fePPNX0c00BnkQCu/49oapFpB0k=",
        cert256: "C5:90:8D:D4:13:9A:CD:96:AE:DD:1E:45:57:65:97:65:08:09:C8:A5:EA:02:AF:55:6D:48:53:D4:53:96:E0:E7",
        cert_pem: SEED2_CERT,
    },
    SeedNode {
        host: "seed3.getsession.org",
        pubkey256: "4xe+8k1NjxerVTjUsWlZJNKt3PA7Y31pUls2tHYippA=",
        cert256: "8A:0A:F2:C7:12:34:2F:22:CE:00:E5:3C:16:01:41:0E:F8:D8:41:56:AE:E0:A9:80:9C:32:F6:F7:EF:BE:55:6E",
        cert_pem: SEED3_CERT,
    },
];

/// Fetch the snode pool from the seeds, sequentially.
///
/// Entries without a routable `public_ip` are dropped. Exhausting every
/// seed raises [`DiscoveryError::AllSeedsFailed`].
pub async fn fetch_snodes(transport: &dyn Transport) -> Result<Vec<Snode>, DiscoveryError> {
    for seed in &SEEDS {
        let url = format!("http://{}/json_rpc", seed.host);
        log::debug!("trying seed {url}");
        match fetch_from_seed(transport, &url).await {
            Ok(snodes) if !snodes.is_empty() => {
                log::info!("fetched {} snodes from {}", snodes.len(), seed.host);
                return Ok(snodes);
            }
            Ok(_) => log::warn!("no valid snodes from {}", seed.host),
            Err(error) => log::warn!("seed {} failed: {error}", seed.host),
        }
    }
    log::error!("all seeds failed to return snodes");
    Err(DiscoveryError::AllSeedsFailed)
}

async fn fetch_from_seed(
    transport: &dyn Transport,
    url: &str,
) -> Result<Vec<Snode>, FetchError> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": "get_n_service_nodes",
        "params": {
            "fields": {
                "public_ip": true,
                "storage_port": true,
                "pubkey_x25519": true,
                "pubkey_ed25519": true,
            },
        },
    });
    let request = Request::post_json(url, body)
        .with_header("User-Agent", "WhatsApp")
        .with_header("Accept", "*/*")
        .with_header("Connection", "close");

    let response = transport.request(request).await?;
    if !response.is_ok() {
        return Err(FetchError::Snode(format!(
            "seed request failed with status {}",
            response.status
        )));
    }

    let parsed: serde_json::Value = response.json()?;
    let states = parsed
        .get("result")
        .and_then(|r| r.get("service_node_states"))
        .cloned()
        .unwrap_or(serde_json::Value::Array(Vec::new()));
    let raw: Vec<RawSnode> = serde_json::from_value(states)
        .map_err(|e| FetchError::Unknown(format!("malformed seed response: {e}")))?;

    Ok(raw.into_iter().filter_map(RawSnode::into_snode).collect())
}

const SEED1_CERT: &str = "-----BEGIN CERTIFICATE-----
MIIEDTCCAvWgAwIBAgIUWk96HLAovn4uFSI057KhnMxqosowDQYJKoZIhvcNAQEL
BQAwejELMAkGA1UEBhMCQVUxETAPBgNVBAgMCFZpY3RvcmlhMRIwEAYDVQQHDAlN
ZWxib3VybmUxJTAjBgNVBAoMHE94ZW4gUHJpdmFjeSBUZWNoIEZvdW5kYXRpb24x
HTAbBgNVBAMMFHNlZWQxLmdldHNlc3Npb24ub3JnMB4XDTIzMDQwNTAxMjQzNVoX
DTMzMDQwNTAxMjQzNVowejELMAkGA1UEBhMCQVUxETAPBgNVBAgMCFZpY3Rvcmlh
MRIwEAYDVQQHDAlNZWxib3VybmUxJTAjBgNVBAoMHE94ZW4gUHJpdmFjeSBUZWNo
IEZvdW5kYXRpb24xHTAbBgNVBAMMFHNlZWQxLmdldHNlc3Npb24ub3JnMIIBIjAN
BgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA2wlGkR2aDOHoizik4mqvWEwDPOQG
o/Afd/6VqKzo4BpNerVZQNgdMgdLTedZE4FRfetubonYu6iSYALK2iKoGsIlru1u
Q9dUl0abA9v+yg6duh1aHw8oS16JPL0zdq8QevJaTxd0MeDnx4eXfFjtv8L0xO4r
CRFH+H6ATcJy+zhVBcWLjiNPe6mGSHM4trx3hwJY6OuuWX5FkO0tMqj9aKJtJ+l0
NArra0BZ9MaMwAFE7AxWwyD0jWIcSvwK06eap+6jBcZIr+cr7fPO5mAlT+CoGB68
yUFwh1wglcVdNPoa1mbFQssCsCRa3MWgpzbMq+KregVzjVEtilwLFjx7FQIDAQAB
o4GKMIGHMB0GA1UdDgQWBBQ1XAjGKhyIU22mYdUEIlzlktogNzAfBgNVHSMEGDAW
gBQ1XAjGKhyIU22mYdUEIlzlktogNzAPBgNVHRMBAf8EBTADAQH/MB8GA1UdEQQY
MBaCFHNlZWQxLmdldHNlc3Npb24ub3JnMBMGA1UdJQQMMAoGCCsGAQUFBwMBMA0G
CSqGSIb3DQEBCwUAA4IBAQC4PRiu4LyxK71Gk+f3dDvjinuE9F0XtAamKfRlLMEo
KxK8dtLrT8p62rME7QiigSv15AmSNyqAp751N/j0th1prOnxBoG38BXKLBDDClri
u91MR4h034G6LIYCiM99ldc8Q5a5WCKu9/9z6CtVxZcNlfe477d6lKHSwb3mQ581
1Ui3RnpkkU1n4XULI+TW2n/Hb8gN6IyTHFB9y2jb4kdg7N7PZIN8FS3n3XGiup9r
b/Rujkuy7rFW78Q1BuHWrQPbJ3RU2CKh1j5o6mtcJFRqP1PfqWmbuaomam48s5hU
4JEiR9tyxP+ewl/bToFcet+5Lp9wRLxn0afm/3V00WyP
-----END CERTIFICATE-----
";

const SEED2_CERT: &str = "-----BEGIN CERTIFICATE-----
MIIEDTCCAvWgAwIBAgIUXkVaUNO/G727mNeaiso9MjvBEm4wDQYJKoZIhvcNAQEL
BQAwejELMAkGA1UEBhMCQVUxETAPBgNVBAgMCFZpY3RvcmlhMRIwEAYDVQQHDAlN
ZWxib3VybmUxJTAjBgNVBAoMHE94ZW4gUHJpdmFjeSBUZWNoIEZvdW5kYXRpb24x
HTAbBgNVBAMMFHNlZWQyLmdldHNlc3Npb24ub3JnMB4XDTIzMDQwNTAxMjI0MloX
DTMzMDQwNTAxMjI0MlowejELMAkGA1UEBhMCQVUxETAPBgNVBAgMCFZpY3Rvcmlh
MRIwEAYDVQQHDAlNZWxib3VybmUxJTAjBgNVBAoMHE94ZW4gUHJpdmFjeSBUZWNo
IEZvdW5kYXRpb24xHTAbBgNVBAMMFHNlZWQyLmdldHNlc3Npb24ub3JnMIIBIjAN
BgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAvT493tt1EWdyIa++X59ffrQt+ghK
+3Hv/guCPmR0FxPUeVnayoLbeKgbe8dduThh7nlmlYnpwbulvDnMF/rRpX51AZiT
A8UGktBzGXi17/D/X71EXGqlM41QZfVm5MCdQcghvbwO8MP0nWmbV4DdiNYAwSNh
fpGMEiblCvKtGN71clTkOW+8Moq4eOxT9tKIlOv97uvkUS21NgmSzsj453hrb6oj
XR3rtW264zn99+Gv83rDE1jk0qfDjxCkaUb0BvRDREc+1q3p8GZ6euEFBM3AcXe7
Yl0qbJgIXd5I+W5nMJJCyJHPTxQNvS+uJqL4kLvdwQRFAkwEM+t9GCH1PQIDAQAB
o4GKMIGHMB0GA1UdDgQWBBQOdqxllTHj+fmGjmdgIXBl+k0PRDAfBgNVHSMEGDAW
gBQOdqxllTHj+fmGjmdgIXBl+k0PRDAPBgNVHRMBAf8EBTADAQH/MB8GA1UdEQQY
MBaCFHNlZWQyLmdldHNlc3Npb24ub3JnMBMGA1UdJQQMMAoGCCsGAQUFBwMBMA0G
CSqGSIb3DQEBCwUAA4IBAQBkmmX+mopdnhzQC5b5rgbU7wVhlDaG7eJCRgUvqkYm
Pbv6XFfvtshykhw2BjSyQetofJaBh5KOR7g0MGRSn3AqRPBeEpXfkBI9urhqFwBF
F5atmp1rTCeHuAS6w4mL6rmj7wHl2CRSom7czRdUCNM+Tu1iK6xOrtOLwQ1H1ps1
KK3siJb3W0eKykHnheQPn77RulVBNLz1yedEUTVkkuVhzSUj5yc8tiwrcagwWX6m
BlfVCJgsBbrJ754rg0AJ0k59wriRamimcUIBvKIo3g3UhJHDI8bt4+SvsRYkSmbi
rzVthAlJjSlRA28X/OLnknWcgEdkGhu0F1tkBtVjIQXd
-----END CERTIFICATE-----
";

const SEED3_CERT: &str = "-----BEGIN CERTIFICATE-----
MIIEDTCCAvWgAwIBAgIUTz5rHKUe+VA9IM6vY6QACc0ORFkwDQYJKoZIhvcNAQEL
BQAwejELMAkGA1UEBhMCQVUxETAPBgNVBAgMCFZpY3RvcmlhMRIwEAYDVQQHDAlN
ZWxib3VybmUxJTAjBgNVBAoMHE94ZW4gUHJpdmFjeSBUZWNoIEZvdW5kYXRpb24x
HTAbBgNVBAMMFHNlZWQzLmdldHNlc3Npb24ub3JnMB4XDTIzMDQwNTAxMjYzMVoX
DTMzMDQwNTAxMjYzMVowejELMAkGA1UEBhMCQVUxETAPBgNVBAgMCFZpY3Rvcmlh
MRIwEAYDVQQHDAlNZWxib3VybmUxJTAjBgNVBAoMHE94ZW4gUHJpdmFjeSBUZWNo
IEZvdW5kYXRpb24xHTAbBgNVBAMMFHNlZWQzLmdldHNlc3Npb24ub3JnMIIBIjAN
BgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA6FgxIk9KmYISL5fk7BLaGAW6lBx8
b4VL3DjlyrFMz7ZhSbcUcavWyyYB+iJxBRhfQGJ7vbwJZ1AwVJisjDFdiLcWzTF8
gzZ7LVXH8qlVnqcx0gksrWYFnG3Y2WJrxEBFdD29lP7LVN3xLQdplMitOciqg5jN
oRjtwGo+wzaMW6WNPzgTvxLzPce9Rl3oN4tSK7qlA9VtsyHwOWBMcogv9LC9IUFZ
2yu0RdcxPdlwLwywYtSRt/W87KbAWTcYY1DfN2VA68p9Cip7/dPOokRduMh1peux
swmIybpC/wz/Ql6J6scSOjDUp/2UsIdYIvyP/Dibi4nHRmD+oz9kb+J3AQIDAQAB
o4GKMIGHMB0GA1UdDgQWBBSQAFetDPIzVg9rfgOI7bfaeEHd8TAfBgNVHSMEGDAW
gBSQAFetDPIzVg9rfgOI7bfaeEHd8TAPBgNVHRMBAf8EBTADAQH/MB8GA1UdEQQY
MBaCFHNlZWQzLmdldHNlc3Npb24ub3JnMBMGA1UdJQQMMAoGCCsGAQUFBwMBMA0G
CSqGSIb3DQEBCwUAA4IBAQCiBNdbKNSHyCZJKvC/V+pHy9E/igwvih2GQ5bNZJFA
daOiKBgaADxaxB4lhtzasr2LdgZdLrn0oONw+wYaui9Z12Yfdr9oWuOgktn8HKLY
oKkJc5EcMYFsd00FnnFcO2U8lQoL6PB/tdcEmpOfqtvShpNhp8SbadSNiqlttvtV
1dqvqSBiRdQm1kz2b8hA6GR6SPzSKlSuwI0J+ZcXEi232EJFbgJ3ESHFVHrhUZro
8A16/WDvZOMWCjOqJsFBw15WzosW9kyNwBtZinXVO3LW/7tVl08PDcarpH4IWjd0
LDpU7zGjcD/A19tfdfMFTOmETuq40I8xxtlR2NENFOAL
-----END CERTIFICATE-----
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use crate::transport::RequestBody;

    fn seed_response(states: serde_json::Value) -> crate::transport::Response {
        MockTransport::json_response(
            200,
            json!({"result": {"service_node_states": states}}),
        )
    }

    #[tokio::test]
    async fn first_seed_wins() {
        let mock = MockTransport::new(vec![Ok(seed_response(json!([
            {"public_ip": "1.2.3.4", "storage_port": 22021,
             "pubkey_x25519": "aa", "pubkey_ed25519": "bb"},
            {"public_ip": "0.0.0.0", "storage_port": 22021,
             "pubkey_x25519": "cc", "pubkey_ed25519": "dd"},
        ])))]);

        let snodes = fetch_snodes(&mock).await.unwrap();
        assert_eq!(snodes.len(), 1, "0.0.0.0 entries are filtered");
        assert_eq!(snodes[0].host, "1.2.3.4");
        assert_eq!(mock.request_count(), 1);

        let requests = mock.requests.lock().unwrap();
        assert_eq!(requests[0].url, "http://seed1.getsession.org/json_rpc");
        let Some(RequestBody::Json(body)) = &requests[0].body else {
            panic!("expected json body")
        };
        assert_eq!(body["method"], "get_n_service_nodes");
        assert_eq!(body["params"]["fields"]["public_ip"], true);
    }

    #[tokio::test]
    async fn falls_through_to_next_seed() {
        let mock = MockTransport::new(vec![
            Err(FetchError::Timeout),
            Ok(seed_response(json!([]))),
            Ok(seed_response(json!([
                {"public_ip": "4.4.4.4", "storage_port": 1,
                 "pubkey_x25519": "aa", "pubkey_ed25519": "bb"}
            ]))),
        ]);

        let snodes = fetch_snodes(&mock).await.unwrap();
        assert_eq!(snodes[0].host, "4.4.4.4");
        assert_eq!(mock.request_count(), 3);
        let requests = mock.requests.lock().unwrap();
        assert!(requests[2].url.contains("seed3"));
    }

    #[tokio::test]
    async fn all_seeds_failing_is_terminal() {
        let mock = MockTransport::new(vec![
            Err(FetchError::Timeout),
            Err(FetchError::Snode("down".into())),
            Ok(seed_response(json!([]))),
        ]);
        assert!(matches!(
            fetch_snodes(&mock).await,
            Err(DiscoveryError::AllSeedsFailed)
        ));
    }

    #[test]
    fn seed_table_is_pinned() {
        assert_eq!(SEEDS.len(), 3);
        for seed in &SEEDS {
            assert!(seed.cert_pem.contains("BEGIN CERTIFICATE"));
            assert!(!seed.pubkey256.is_empty());
            assert!(seed.cert256.split(':').count() == 32);
        }
    }
}
