use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::settings::InterceptMode;
use crate::sniffer::HostNameSniffer;
use crate::{proxy, sniffer, utils, SETTINGS};

pub async fn redirect_worker() -> Result<()> {
    let listen_addr = match &SETTINGS.read().await.disable_ipv6 {
        true => "0.0.0.0",
        false => "[::]",
    };

    let listener = match &SETTINGS.read().await.listen {
        Some(addr) => TcpListener::bind(addr).await?,
        None => TcpListener::bind(format!("{}:0", listen_addr)).await?,
    };

    let port = listener
        .local_addr()
        .context("TCP socket should have local_addr")?
        .port();
    info!("redirect listen: {}", listener.local_addr()?);

    {
        let settings = SETTINGS.read().await;
        if let InterceptMode::REDIRECT {
            local_traffic,
            ports,
            direct_mark,
            proxy_chain,
        } = &settings.intercept_mode
        {
            if utils::geteuid() != 0 {
                bail!("redirect interception requires root to edit the nat table");
            }

            let nat = NatRedirect {
                chain: proxy_chain,
                ports,
                redirect_port: port,
                direct_mark: *direct_mark,
                local_traffic: *local_traffic,
                disable_ipv6: settings.disable_ipv6,
            };
            // clear leftovers from a crashed run before installing
            teardown_nat(proxy_chain);
            if let Err(err) = nat.install() {
                teardown_nat(proxy_chain);
                return Err(err);
            }
        }
    }

    tokio::select! {
        _ = accept_socket_loop(listener) => {},
        Err(err) = utils::receive_signal() => {
            if let InterceptMode::REDIRECT { proxy_chain, .. } = &SETTINGS.read().await.intercept_mode {
                teardown_nat(proxy_chain);
            }
            return Err(err);
        },
    };

    Ok(())
}

async fn accept_socket_loop(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((mut socket, _)) => {
                tokio::spawn(async move {
                    if let Err(e) = handle_tcp(&mut socket).await {
                        error!("{:#}", e);
                    }
                });
            }
            Err(e) => warn!("couldn't get client: {:?}", e),
        }
    }
}

async fn handle_tcp(inbound: &mut TcpStream) -> Result<()> {
    let peer = inbound.peer_addr()?;
    let origin = match &SETTINGS.read().await.default_origin {
        Some(origin) => origin.clone(),
        None => original_destination(inbound)?.to_string(),
    };

    let mut sniffer = sniffer::from_settings(&SETTINGS.read().await.sniff);
    let sniff_started = tokio::time::Instant::now();
    let target = match sniffer.sniff_host_name(inbound).await {
        Ok(host) if utils::is_valid_domain(&host) => {
            info!("extracted hostname for client {}: {}", peer, host);
            with_origin_port(host, &origin)
        }
        Ok(host) => {
            warn!(
                "ignoring implausible hostname {:?} sniffed from client {}",
                host, peer
            );
            origin.clone()
        }
        Err(err) if err.is_fatal() => {
            return Err(err)
                .with_context(|| format!("dropping client {}: sniffing broke the stream", peer));
        }
        Err(err) => {
            info!("hostname extraction failed for client {}: {}", peer, err);
            origin.clone()
        }
    };

    if SETTINGS.read().await.debug {
        info!(
            "sniffing for client {} took {}us",
            peer,
            sniff_started.elapsed().as_micros()
        );
    }

    let (mut outbound, leftover) = proxy::connect_upstream(&target)
        .await
        .with_context(|| format!("failed to open a tunnel to {} for client {}", target, peer))?;

    let prefix = sniffer.take_buffered_data();
    if !prefix.is_empty() {
        outbound
            .write_all(&prefix)
            .await
            .context("failed to replay the sniffed prefix upstream")?;
    }
    if !leftover.is_empty() {
        inbound
            .write_all(&leftover)
            .await
            .context("failed to forward origin bytes that followed the CONNECT response")?;
    }

    utils::transfer_tcp(inbound, &mut outbound).await
}

/// Sniffed hostnames usually come without a port; the original destination
/// always knows it.
fn with_origin_port(host: String, origin: &str) -> String {
    if host.contains(':') {
        return host;
    }
    match origin.rsplit_once(':') {
        Some((_, port)) => format!("{}:{}", host, port),
        None => host,
    }
}

/// v4-mapped addresses compare unequal to their plain v4 form, so unmap
/// before using an address for family dispatch or identity checks.
fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => SocketAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn original_destination(inbound: &TcpStream) -> Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::os::fd::{AsRawFd, BorrowedFd};

    use nix::sys::socket::getsockopt;
    use nix::sys::socket::sockopt::{Ip6tOriginalDst, OriginalDst};

    let peer = inbound.peer_addr()?;
    // SAFETY: the fd is valid for the lifetime of inbound
    let fd = unsafe { BorrowedFd::borrow_raw(inbound.as_raw_fd()) };

    let origin = match unmap(peer) {
        SocketAddr::V4(_) => {
            let addr = getsockopt(&fd, OriginalDst).context("failed to get original ipv4 addr")?;
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(addr.sin_addr.s_addr.to_be())),
                addr.sin_port.to_be(),
            )
        }
        SocketAddr::V6(v6) => {
            let addr = getsockopt(&fd, Ip6tOriginalDst).context(format!(
                "failed to get original ipv6 addr with peer addr {}",
                v6
            ))?;
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr)),
                addr.sin6_port.to_be(),
            )
        }
    };

    let local = inbound.local_addr()?;
    if origin == unmap(local) {
        bail!(
            "received non-REDIRECTed traffic to {} from {}, discarding",
            local,
            peer
        );
    }

    Ok(origin)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn original_destination(_inbound: &TcpStream) -> Result<SocketAddr> {
    bail!("SO_ORIGINAL_DST is only available on Linux")
}

const NAT_TABLE: &str = "nat";
static NAT_HOOKS: [&str; 2] = ["PREROUTING", "OUTPUT"];

/// Per-family view of the nat table. The bypass lists are the
/// special-purpose ranges (loopback, private and CGNAT space, link-local,
/// multicast/broadcast, mapped forms) that must keep flowing directly no
/// matter which ports are intercepted.
struct NatFamily {
    label: &'static str,
    is_v6: bool,
    bypass: &'static [&'static str],
}

static NAT_FAMILIES: [NatFamily; 2] = [
    NatFamily {
        label: "ipv4",
        is_v6: false,
        bypass: &[
            "0.0.0.0/8",
            "127.0.0.0/8",
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "100.64.0.0/10",
            "169.254.0.0/16",
            "255.255.255.255/32",
        ],
    },
    NatFamily {
        label: "ipv6",
        is_v6: true,
        bypass: &[
            "::1/128",
            "100::/64",
            "2002::/16",
            "fc00::/7",
            "fe80::/10",
            "ff00::/8",
            "::ffff:0:0/96",
            "::ffff:0:0:0/96",
        ],
    },
];

/// The nat rule set that steers intercepted destination ports into our
/// listener, assembled from the settings-driven chain name, multiport
/// list, listener port and bypass mark.
struct NatRedirect<'a> {
    chain: &'a str,
    ports: &'a str,
    redirect_port: u16,
    direct_mark: u32,
    local_traffic: bool,
    disable_ipv6: bool,
}

impl NatRedirect<'_> {
    /// Rules for the dedicated chain, exemptions first. Whatever falls
    /// through them is REDIRECTed to the listener.
    fn chain_rules(&self, family: &NatFamily) -> Vec<String> {
        let mut rules: Vec<String> = family
            .bypass
            .iter()
            .map(|range| format!("-d {} -j RETURN", range))
            .collect();
        rules.push("-m addrtype --dst-type LOCAL -j RETURN".to_owned());
        // Upstream sockets opened by this process carry the direct mark.
        rules.push(format!("-m mark --mark {} -j RETURN", self.direct_mark));
        rules.push(format!(
            "-p tcp -m multiport --dports {} -j REDIRECT --to-ports {}",
            self.ports, self.redirect_port,
        ));
        rules
    }

    fn hooks(&self) -> &'static [&'static str] {
        if self.local_traffic {
            &NAT_HOOKS
        } else {
            &NAT_HOOKS[..1]
        }
    }

    fn install(&self) -> Result<()> {
        for family in &NAT_FAMILIES {
            if family.is_v6 && self.disable_ipv6 {
                continue;
            }
            self.install_family(family).map_err(|err| {
                anyhow::anyhow!(
                    "failed to install {} nat redirect rules: {}",
                    family.label,
                    err
                )
            })?;
        }
        Ok(())
    }

    fn install_family(&self, family: &NatFamily) -> Result<(), Box<dyn std::error::Error>> {
        let ipt = iptables::new(family.is_v6)?;
        ipt.new_chain(NAT_TABLE, self.chain)?;
        for rule in self.chain_rules(family) {
            ipt.append(NAT_TABLE, self.chain, &rule)?;
        }
        for hook in self.hooks() {
            ipt.append(NAT_TABLE, hook, &format!("-j {}", self.chain))?;
        }
        Ok(())
    }
}

/// Best-effort removal of the chain and every jump into it, whether it was
/// installed by this run or left behind by a crashed one.
fn teardown_nat(chain: &str) {
    let jump = format!("-j {}", chain);
    for family in &NAT_FAMILIES {
        let Ok(ipt) = iptables::new(family.is_v6) else {
            continue;
        };
        for hook in NAT_HOOKS {
            let Ok(rules) = ipt.list(NAT_TABLE, hook) else {
                continue;
            };
            let unhook = format!("-A {}", hook);
            for rule in rules.iter().filter(|rule| rule.contains(&jump)) {
                let _ = ipt.delete_all(NAT_TABLE, hook, rule.trim_start_matches(&unhook).trim());
            }
        }
        let _ = ipt.flush_chain(NAT_TABLE, chain);
        let _ = ipt.delete_chain(NAT_TABLE, chain);
    }
}
