use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hickory_client::client::{AsyncClient, ClientHandle, Signer};
use hickory_client::proto::iocompat::AsyncIoTokioAsStd;
use hickory_client::proto::rr::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_client::proto::rr::dnssec::tsig::TSigner;
use hickory_client::proto::rr::rdata::TXT;
use hickory_client::proto::rr::{Name, RData, Record, RecordType};
use hickory_client::proto::rustls::tls_client_connect;
use hickory_client::proto::op::ResponseCode;
use hickory_client::tcp::TcpClientStream;
use hickory_client::udp::UdpClientStream;
use tokio::net::TcpStream as TokioTcpStream;
use tokio::net::UdpSocket;
use tracing::debug;

/// TTL published on BIP-353 TXT records.
const RECORD_TTL: u32 = 3600;
/// TSIG time fudge in seconds.
const TSIG_FUDGE: u16 = 300;
/// Client-side timeout on any DNS exchange.
const DNS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("dns configuration error: {0}")]
    Config(String),
    #[error("dns exchange failed: {0}")]
    Exchange(String),
    #[error("dns update refused: {0}")]
    Refused(ResponseCode),
}

/// Publisher of BIP-353 address records. `set` returns the TTL the record
/// was published with; a zero TTL is the sentinel for "no DNS configured,
/// don't persist the offer". Both operations are idempotent at the DNS
/// layer.
#[async_trait::async_trait]
pub trait DnsService: Send + Sync {
    async fn set(&self, username: &str, offer: &str) -> Result<u32, DnsError>;
    async fn remove(&self, username: &str) -> Result<(), DnsError>;
}

/// Satisfies the publisher contract for deployments without DNS.
pub struct NoDns;

#[async_trait::async_trait]
impl DnsService for NoDns {
    async fn set(&self, username: &str, offer: &str) -> Result<u32, DnsError> {
        debug!("no DNS configured, not publishing username: {username}, offer: {offer}");
        Ok(0)
    }

    async fn remove(&self, username: &str) -> Result<(), DnsError> {
        debug!("no DNS configured, not removing username: {username}");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum DnsProtocol {
    Udp,
    Tcp,
    TcpTls,
}

/// TSIG-authenticated dynamic updates of `_bitcoin-payment` TXT records,
/// RFC 2136 against the configured name server.
pub struct TsigDns {
    name_server: String,
    protocol: DnsProtocol,
    zone: Name,
    signer: TSigner,
}

impl TsigDns {
    /// `name_server` is a `host:port` pair; `domain` is both the zone the
    /// updates go to and the suffix of the published record names.
    /// `tsig_secret` is the base64-encoded shared key.
    pub fn new(
        name_server: String,
        protocol: DnsProtocol,
        domain: &str,
        tsig_key: &str,
        tsig_secret: &str,
    ) -> Result<Self, DnsError> {
        let zone = Name::from_ascii(format!("{domain}."))
            .map_err(|e| DnsError::Config(format!("invalid zone {domain}: {e}")))?;
        let key_name = Name::from_ascii(tsig_key)
            .map_err(|e| DnsError::Config(format!("invalid TSIG key name {tsig_key}: {e}")))?;
        let key = BASE64
            .decode(tsig_secret)
            .map_err(|e| DnsError::Config(format!("TSIG secret is not valid base64: {e}")))?;
        let signer = TSigner::new(key, TsigAlgorithm::HmacSha256, key_name, TSIG_FUDGE)
            .map_err(|e| DnsError::Config(format!("failed to build TSIG signer: {e}")))?;

        Ok(Self {
            name_server,
            protocol,
            zone,
            signer,
        })
    }

    fn record_name(&self, username: &str) -> Result<Name, DnsError> {
        Name::from_ascii(format!("{username}.user._bitcoin-payment"))
            .map_err(|e| DnsError::Config(format!("invalid record name for {username}: {e}")))?
            .append_domain(&self.zone)
            .map_err(|e| DnsError::Config(format!("record name too long for {username}: {e}")))
    }

    async fn resolve_name_server(&self) -> Result<SocketAddr, DnsError> {
        let mut addrs = tokio::net::lookup_host(&self.name_server)
            .await
            .map_err(|e| DnsError::Config(format!("cannot resolve {}: {e}", self.name_server)))?;
        addrs
            .next()
            .ok_or_else(|| DnsError::Config(format!("no address for {}", self.name_server)))
    }

    async fn connect(&self) -> Result<AsyncClient, DnsError> {
        let addr = self.resolve_name_server().await?;
        let signer = Some(Arc::new(Signer::from(self.signer.clone())));

        let client = match self.protocol {
            DnsProtocol::Udp => {
                let stream = UdpClientStream::<UdpSocket, _>::with_timeout_and_signer(
                    addr,
                    DNS_TIMEOUT,
                    signer,
                );
                let (client, background) = AsyncClient::connect(stream)
                    .await
                    .map_err(|e| DnsError::Exchange(e.to_string()))?;
                tokio::spawn(background);
                client
            }
            DnsProtocol::Tcp => {
                let (stream, sender) =
                    TcpClientStream::<AsyncIoTokioAsStd<TokioTcpStream>>::with_timeout(
                        addr,
                        DNS_TIMEOUT,
                    );
                let (client, background) =
                    AsyncClient::with_timeout(stream, sender, DNS_TIMEOUT, signer)
                        .await
                        .map_err(|e| DnsError::Exchange(e.to_string()))?;
                tokio::spawn(background);
                client
            }
            DnsProtocol::TcpTls => {
                let host = self
                    .name_server
                    .rsplit_once(':')
                    .map_or(self.name_server.as_str(), |(host, _)| host)
                    .to_string();
                let (stream, sender) = tls_client_connect::<AsyncIoTokioAsStd<TokioTcpStream>>(
                    addr,
                    host,
                    Arc::new(tls_config()),
                );
                let (client, background) =
                    AsyncClient::with_timeout(stream, sender, DNS_TIMEOUT, signer)
                        .await
                        .map_err(|e| DnsError::Exchange(e.to_string()))?;
                tokio::spawn(background);
                client
            }
        };
        Ok(client)
    }
}

#[async_trait::async_trait]
impl DnsService for TsigDns {
    async fn set(&self, username: &str, offer: &str) -> Result<u32, DnsError> {
        let name = self.record_name(username)?;
        let record = Record::from_rdata(
            name.clone(),
            RECORD_TTL,
            RData::TXT(TXT::new(vec![format!("bitcoin:?lno={offer}")])),
        );
        let mut client = self.connect().await?;

        // A dynamic update with a delete-RRset prelude makes Set a
        // replacement rather than an accumulation of stale offers.
        let deleted = client
            .delete_rrset(
                Record::with(name, RecordType::TXT, 0),
                self.zone.clone(),
            )
            .await
            .map_err(|e| DnsError::Exchange(e.to_string()))?;
        if deleted.response_code() != ResponseCode::NoError {
            return Err(DnsError::Refused(deleted.response_code()));
        }

        let appended = client
            .append(record, self.zone.clone(), false)
            .await
            .map_err(|e| DnsError::Exchange(e.to_string()))?;
        if appended.response_code() != ResponseCode::NoError {
            return Err(DnsError::Refused(appended.response_code()));
        }

        debug!("published TXT record for {username}");
        Ok(RECORD_TTL)
    }

    async fn remove(&self, username: &str) -> Result<(), DnsError> {
        let name = self.record_name(username)?;
        let mut client = self.connect().await?;
        let deleted = client
            .delete_rrset(
                Record::with(name, RecordType::TXT, 0),
                self.zone.clone(),
            )
            .await
            .map_err(|e| DnsError::Exchange(e.to_string()))?;
        if deleted.response_code() != ResponseCode::NoError {
            return Err(DnsError::Refused(deleted.response_code()));
        }

        debug!("removed TXT record for {username}");
        Ok(())
    }
}

fn tls_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
