//! Sample DHCP client runner.
//!
//! Takes an interface and hardware address on the command line, runs one
//! probe and logs the events. Mainly a smoke-test harness and a reference
//! for embedding the library into a real poll loop.

use clap::Parser;
use dhcp4c::logging::init_logging;
use dhcp4c::{Client, ClientConfig, Event, ProbeConfig};
use std::net::Ipv4Addr;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dhcp4c")]
#[command(about = "DHCP test client")]
struct Cli {
    /// Index of the interface to run on
    #[arg(long)]
    ifindex: i32,

    /// Hardware address, e.g. 02:00:00:00:00:01
    #[arg(long)]
    mac: String,

    /// Broadcast hardware address, e.g. ff:ff:ff:ff:ff:ff
    #[arg(long, default_value = "ff:ff:ff:ff:ff:ff")]
    broadcast_mac: String,

    /// Start with an INIT-REBOOT REQUEST for this previously held address
    #[arg(long)]
    init_reboot: Option<Ipv4Addr>,

    /// Take the first offer instead of collecting for the selection window
    #[arg(long)]
    accept_first_offer: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: full, compact or json
    #[arg(long, default_value = "full")]
    log_format: String,
}

fn parse_mac(s: &str) -> Result<Vec<u8>, String> {
    s.split(':')
        .map(|part| u8::from_str_radix(part, 16).map_err(|e| format!("bad mac byte {part:?}: {e}")))
        .collect()
}

fn run(cli: &Cli) -> dhcp4c::Result<()> {
    let mac = parse_mac(&cli.mac).map_err(dhcp4c::Error::Config)?;
    let broadcast = parse_mac(&cli.broadcast_mac).map_err(dhcp4c::Error::Config)?;

    let mut config = ClientConfig::new();
    config
        .set_ifindex(cli.ifindex)
        .set_mac(&mac)
        .set_broadcast_mac(&broadcast);
    let mut client = Client::new(config)?;

    let mut probe_config = ProbeConfig::new();
    probe_config.set_accept_first_offer(cli.accept_first_offer);
    if let Some(ip) = cli.init_reboot {
        probe_config.set_init_reboot(true).set_requested_ip(ip);
    }
    let probe = client.probe(probe_config)?;

    loop {
        let mut pfd = libc::pollfd {
            fd: client.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, -1) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(dhcp4c::Error::Io(err));
        }
        if pfd.revents & !libc::POLLIN != 0 {
            return Err(dhcp4c::Error::InvalidState(
                "poll reported an error condition".into(),
            ));
        }
        if pfd.revents & libc::POLLIN == 0 {
            continue;
        }

        client.dispatch()?;

        while let Some(event) = client.pop_event() {
            match event {
                Event::Offer(lease) => {
                    info!(address = %lease.address(), server = %lease.server_id(), "offer");
                    // Later offers lose; the first one was already selected.
                    if probe.state() == dhcp4c::State::Selecting {
                        probe.select(&lease)?;
                    }
                }
                Event::Granted(lease) => {
                    info!(
                        address = %lease.address(),
                        prefix = lease.prefix_len().unwrap_or(32),
                        router = ?lease.routers(),
                        dns = ?lease.dns_servers(),
                        lifetime = lease.lifetime().as_secs(),
                        "granted"
                    );
                    probe.accept()?;
                }
                Event::Extended(lease) => {
                    info!(
                        address = %lease.address(),
                        lifetime = lease.lifetime().as_secs(),
                        "extended"
                    );
                }
                Event::Retracted => info!("retracted"),
                Event::Expired => {
                    info!("expired");
                    return Ok(());
                }
                Event::Cancelled => {
                    info!("cancelled");
                    return Ok(());
                }
                Event::Down => {
                    error!("client down");
                    return Err(dhcp4c::Error::InvalidState("client down".into()));
                }
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    if let Err(e) = run(&cli) {
        error!(error = %e, "client failed");
        std::process::exit(1);
    }
}
