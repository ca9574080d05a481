use clap::Parser;
use url::Url;

use crate::dns::DnsProtocol;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// URL the server binds its listener to; only host and port are used.
    #[arg(long, env = "SERVER_INTERNAL_URL", default_value = "http://localhost:8080")]
    pub internal_url: String,

    /// URL under which payers and wallets reach this server; used in every
    /// issued lnurl, callback URL and lightning address.
    #[arg(long, env = "SERVER_EXTERNAL_URL", default_value = "http://localhost:8080")]
    pub external_url: String,

    /// Connection string to the postgres database.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Automatically apply migrations to the database.
    #[arg(long)]
    pub auto_migrate: bool,

    /// Name server accepting dynamic updates, as host:port. Without it the
    /// server runs with DNS publication disabled.
    #[arg(long, env = "NAME_SERVER")]
    pub name_server: Option<String>,

    #[arg(long, env = "DNS_PROTOCOL", value_enum, default_value = "udp")]
    pub dns_protocol: DnsProtocol,

    /// TSIG key name authorized for dynamic updates.
    #[arg(long, env = "TSIG_KEY")]
    pub tsig_key: Option<String>,

    /// Base64-encoded TSIG shared secret.
    #[arg(long, env = "TSIG_SECRET")]
    pub tsig_secret: Option<String>,

    /// Loglevel to use. Can be used to filter logs through the env filter
    /// format.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn internal_addr(&self) -> anyhow::Result<String> {
        host_port(&self.internal_url)
    }

    /// External base URL with any trailing slash removed.
    pub fn root_url(&self) -> anyhow::Result<String> {
        let url = Url::parse(&self.external_url)?;
        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    /// Host (and port when present) of the external URL; the domain of
    /// issued addresses and published DNS records.
    pub fn domain(&self) -> anyhow::Result<String> {
        host_port(&self.external_url)
    }
}

fn host_port(raw: &str) -> anyhow::Result<String> {
    let url = Url::parse(raw)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("URL {raw} has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
