use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use nspipe::addr::{Endpoint, Protocol};
use nspipe::config::{ClientConfig, ListenConfig};
use nspipe::netns::NetnsSpec;
use nspipe::proxy;
use nspipe::tls::TlsSettings;
use nspipe::user::UserSpec;

/// One proxy definition. Several definitions may be chained on one command
/// line with a literal `--next` between them.
#[derive(Parser, Debug)]
#[command(
    name = "nspipe",
    version,
    about = "forward connections across namespace and privilege boundaries"
)]
struct Cli {
    #[arg(long = "listen.addr", help = "listen on address (or FD:n)")]
    listen_addr: Option<String>,
    #[arg(long = "listen.protocol", default_value = "tcp")]
    listen_protocol: Protocol,
    #[arg(
        long = "listen.conn",
        help = "the listen fd is a unix socket carrying accepted connections"
    )]
    listen_conn: bool,
    #[arg(long = "listen.fork", help = "accept in a forked child")]
    listen_fork: bool,
    #[arg(long = "listen.user", help = "change to user on listen thread")]
    listen_user: Option<String>,
    #[arg(long = "listen.group", help = "change to group on listen thread")]
    listen_group: Option<String>,
    #[arg(long = "listen.uid", default_value_t = 0)]
    listen_uid: u32,
    #[arg(long = "listen.gid", default_value_t = 0)]
    listen_gid: u32,
    #[arg(long = "listen.debug")]
    listen_debug: bool,

    #[arg(long = "listen.tls.ca-file", help = "TLS CA file")]
    listen_tls_ca_file: Vec<PathBuf>,
    #[arg(long = "listen.tls.cert-file", help = "TLS cert file")]
    listen_tls_cert_file: Option<PathBuf>,
    #[arg(long = "listen.tls.key-file", help = "TLS key file")]
    listen_tls_key_file: Option<PathBuf>,
    #[arg(
        long = "listen.tls.allowed-dns-name",
        help = "accept only client certs with this SAN DNS name"
    )]
    listen_tls_allowed_dns_name: Vec<String>,

    #[arg(long = "listen.netns.path", help = "a netns path")]
    listen_netns_path: Option<PathBuf>,
    #[arg(long = "listen.netns.net-name", help = "an iproute2 netns name")]
    listen_netns_net_name: Option<String>,
    #[arg(long = "listen.netns.docker-name", help = "a docker identifier")]
    listen_netns_docker_name: Option<String>,
    #[arg(long = "listen.netns.systemd-unit", help = "a systemd unit name")]
    listen_netns_systemd_unit: Option<String>,
    #[arg(long = "listen.netns.pid", help = "process id of a running process")]
    listen_netns_pid: Option<i32>,
    #[arg(long = "listen.netns.tid", help = "thread id inside that process")]
    listen_netns_tid: Option<i32>,
    #[arg(long = "listen.netns.disable", help = "do not try to use namespaces")]
    listen_netns_disable: bool,

    #[arg(long = "client.addr", help = "connect to address (or FD:n)")]
    client_addr: Option<String>,
    #[arg(long = "client.protocol", default_value = "tcp")]
    client_protocol: Protocol,
    #[arg(long = "client.fork", help = "dial in a forked child")]
    client_fork: bool,
    #[arg(long = "client.source-ip", help = "IP used as source address")]
    client_source_ip: Option<IpAddr>,
    #[arg(
        long = "client.timeout",
        default_value_t = 5,
        help = "connect timeout in seconds"
    )]
    client_timeout: u64,
    #[arg(long = "client.user")]
    client_user: Option<String>,
    #[arg(long = "client.group")]
    client_group: Option<String>,
    #[arg(long = "client.uid", default_value_t = 0)]
    client_uid: u32,
    #[arg(long = "client.gid", default_value_t = 0)]
    client_gid: u32,
    #[arg(long = "client.debug")]
    client_debug: bool,

    #[arg(long = "client.tls.ca-file")]
    client_tls_ca_file: Vec<PathBuf>,
    #[arg(long = "client.tls.cert-file")]
    client_tls_cert_file: Option<PathBuf>,
    #[arg(long = "client.tls.key-file")]
    client_tls_key_file: Option<PathBuf>,

    #[arg(long = "client.netns.path")]
    client_netns_path: Option<PathBuf>,
    #[arg(long = "client.netns.net-name")]
    client_netns_net_name: Option<String>,
    #[arg(long = "client.netns.docker-name")]
    client_netns_docker_name: Option<String>,
    #[arg(long = "client.netns.systemd-unit")]
    client_netns_systemd_unit: Option<String>,
    #[arg(long = "client.netns.pid")]
    client_netns_pid: Option<i32>,
    #[arg(long = "client.netns.tid")]
    client_netns_tid: Option<i32>,
    #[arg(long = "client.netns.disable")]
    client_netns_disable: bool,

    #[arg(long)]
    debug: bool,
}

#[allow(clippy::too_many_arguments)]
fn netns_spec(
    path: Option<PathBuf>,
    net_name: Option<String>,
    docker_name: Option<String>,
    systemd_unit: Option<String>,
    pid: Option<i32>,
    tid: Option<i32>,
    disable: bool,
) -> NetnsSpec {
    let mut spec = NetnsSpec::default();
    spec.path = path;
    spec.net_name = net_name;
    spec.docker_name = docker_name;
    spec.systemd_unit = systemd_unit;
    spec.pid = pid;
    spec.tid = tid;
    spec.disable = disable;
    spec
}

impl Cli {
    fn into_configs(self) -> (ListenConfig, ClientConfig) {
        let listen = ListenConfig {
            addr: Endpoint::new(self.listen_addr.unwrap_or_default()),
            protocol: self.listen_protocol,
            conn: self.listen_conn,
            fork: self.listen_fork,
            user: UserSpec {
                user: self.listen_user,
                group: self.listen_group,
                uid: self.listen_uid,
                gid: self.listen_gid,
            },
            netns: Arc::new(netns_spec(
                self.listen_netns_path,
                self.listen_netns_net_name,
                self.listen_netns_docker_name,
                self.listen_netns_systemd_unit,
                self.listen_netns_pid,
                self.listen_netns_tid,
                self.listen_netns_disable,
            )),
            tls: TlsSettings {
                ca_files: self.listen_tls_ca_file,
                cert_file: self.listen_tls_cert_file,
                key_file: self.listen_tls_key_file,
                allowed_dns_names: self.listen_tls_allowed_dns_name,
            },
        };

        let client = ClientConfig {
            addr: Endpoint::new(self.client_addr.unwrap_or_default()),
            protocol: self.client_protocol,
            fork: self.client_fork,
            source_ip: self.client_source_ip,
            timeout: Duration::from_secs(self.client_timeout),
            user: UserSpec {
                user: self.client_user,
                group: self.client_group,
                uid: self.client_uid,
                gid: self.client_gid,
            },
            netns: Arc::new(netns_spec(
                self.client_netns_path,
                self.client_netns_net_name,
                self.client_netns_docker_name,
                self.client_netns_systemd_unit,
                self.client_netns_pid,
                self.client_netns_tid,
                self.client_netns_disable,
            )),
            tls: TlsSettings {
                ca_files: self.client_tls_ca_file,
                cert_file: self.client_tls_cert_file,
                key_file: self.client_tls_key_file,
                allowed_dns_names: Vec::new(),
            },
        };

        (listen, client)
    }
}

fn split_on_next(args: &[String]) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    for arg in args {
        if arg == "--next" {
            groups.push(std::mem::take(&mut current));
        } else {
            current.push(arg.clone());
        }
    }
    groups.push(current);
    groups
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let argv: Vec<String> = std::env::args().collect();
    let program = argv[0].clone();

    let parsed: Vec<Cli> = split_on_next(&argv[1..])
        .into_iter()
        .map(|group| Cli::parse_from(std::iter::once(program.clone()).chain(group)))
        .collect();

    let level = if parsed.iter().any(|c| c.debug || c.listen_debug || c.client_debug) {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_max_level(level)
        .init();

    let runtime = tokio::runtime::Runtime::new().context("building runtime")?;
    Ok(runtime.block_on(run_all(parsed)))
}

async fn run_all(parsed: Vec<Cli>) -> ExitCode {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt, shutting down");
                cancel.cancel();
            }
        });
    }

    let mut proxies = JoinSet::new();
    for cli in parsed {
        let (listen, client) = cli.into_configs();
        let cancel = cancel.clone();
        proxies.spawn(async move {
            let label = format!("{} -> {}", listen.addr, client.addr);
            (label, proxy::run(&listen, &client, cancel).await)
        });
    }

    let mut failed = false;
    while let Some(joined) = proxies.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((label, Err(e))) => {
                error!("{label}: {e}");
                failed = true;
                // first fatal error takes the rest of the process down
                cancel.cancel();
            }
            Err(e) => {
                error!("proxy task: {e}");
                failed = true;
                cancel.cancel();
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
