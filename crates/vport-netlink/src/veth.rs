//! Veth pair lifecycle and container address assignment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use futures::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::RouteScope;
use rtnetlink::Handle;
use tracing::{debug, info};

use crate::error::{NetlinkError, NetlinkResult};
use crate::netns::NetnsGuard;

/// The address configuration applied to the container interface, reported
/// back to the orchestrator in the CNI result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfiguredAddress {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

/// Creates the veth pair for a container inside its network namespace.
///
/// Inside `netns`: create the pair, bring the container end up (with `mtu`),
/// read its MAC, and move the host end out into the host namespace. Back
/// outside: bring the host end up. Returns the container end's MAC address.
///
/// On failure the caller is responsible for tearing down whatever was
/// partially created.
pub async fn create_veth_pair(
    netns: impl AsRef<Path>,
    host_if: &str,
    container_if: &str,
    mtu: u32,
) -> NetlinkResult<String> {
    debug!(host_if, container_if, "Creating veth pair");

    let mac;
    {
        let guard = NetnsGuard::enter(&netns)?;
        let handle = spawn_handle()?;

        handle
            .link()
            .add()
            .veth(host_if.to_string(), container_if.to_string())
            .execute()
            .await
            .map_err(|e| NetlinkError::PairCreate {
                host: host_if.to_string(),
                container: container_if.to_string(),
                message: e.to_string(),
            })?;

        let container = lookup_link(&handle, container_if).await?;
        mac = hardware_address(&container).ok_or_else(|| NetlinkError::NoHardwareAddress {
            name: container_if.to_string(),
        })?;
        handle
            .link()
            .set(container.header.index)
            .mtu(mtu)
            .up()
            .execute()
            .await
            .map_err(|e| NetlinkError::LinkUp {
                name: container_if.to_string(),
                message: e.to_string(),
            })?;

        let host = lookup_link(&handle, host_if).await?;
        handle
            .link()
            .set(host.header.index)
            .setns_by_fd(guard.host_ns_fd())
            .execute()
            .await
            .map_err(|e| NetlinkError::MoveToHostNamespace {
                name: host_if.to_string(),
                message: e.to_string(),
            })?;
    }

    // Back in the host namespace: bring the host end up.
    let handle = spawn_handle()?;
    let host = lookup_link(&handle, host_if).await?;
    handle
        .link()
        .set(host.header.index)
        .mtu(mtu)
        .up()
        .execute()
        .await
        .map_err(|e| NetlinkError::LinkUp {
            name: host_if.to_string(),
            message: e.to_string(),
        })?;

    debug!(container_if, %mac, "Veth pair ready");
    Ok(mac)
}

/// Configures the container end of the veth inside `netns` with the resolved
/// address: a link-scoped /32 route to the gateway, the default route via it
/// (a pre-existing default route is tolerated), then the address itself.
pub async fn assign_address(
    netns: impl AsRef<Path>,
    ifname: &str,
    ip: Ipv4Addr,
    gateway: Ipv4Addr,
    mask: Ipv4Addr,
) -> NetlinkResult<ConfiguredAddress> {
    let prefix_len = mask_to_prefix(mask)?;
    let _guard = NetnsGuard::enter(&netns)?;
    let handle = spawn_handle()?;
    let link = lookup_link(&handle, ifname).await?;
    let index = link.header.index;

    // Connected route to the gateway so the default route has a next hop.
    handle
        .route()
        .add()
        .v4()
        .destination_prefix(gateway, 32)
        .output_interface(index)
        .scope(RouteScope::Link)
        .execute()
        .await
        .map_err(|e| NetlinkError::Route {
            message: format!("gateway host route via {ifname}: {e}"),
        })?;

    let default_route = handle
        .route()
        .add()
        .v4()
        .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
        .gateway(gateway)
        .output_interface(index)
        .execute()
        .await;
    match default_route {
        Ok(()) => debug!(%gateway, "Added default route via gateway"),
        Err(rtnetlink::Error::NetlinkError(msg))
            if msg.to_io().kind() == std::io::ErrorKind::AlreadyExists =>
        {
            info!("Default route already exists in the container; keeping it");
        }
        Err(e) => {
            return Err(NetlinkError::Route {
                message: format!("default route via {gateway}: {e}"),
            })
        }
    }

    handle
        .address()
        .add(index, IpAddr::V4(ip), prefix_len)
        .execute()
        .await
        .map_err(|e| NetlinkError::AddressAssign {
            name: ifname.to_string(),
            address: format!("{ip}/{prefix_len}"),
            message: e.to_string(),
        })?;

    debug!(ifname, %ip, prefix_len, "Assigned address to container interface");
    Ok(ConfiguredAddress {
        ip,
        prefix_len,
        gateway,
    })
}

/// Deletes a veth pair from the host namespace by its host-side name.
/// Deleting one end removes the peer as well. Not finding the link is
/// reported as an error; cleanup paths treat it as non-fatal.
pub async fn delete_veth_pair(host_if: &str, container_if: &str) -> NetlinkResult<()> {
    debug!(host_if, container_if, "Deleting veth pair");
    let handle = spawn_handle()?;
    let link = lookup_link(&handle, host_if).await?;
    handle
        .link()
        .del(link.header.index)
        .execute()
        .await
        .map_err(|e| NetlinkError::LinkDelete {
            name: host_if.to_string(),
            message: e.to_string(),
        })
}

/// Converts a dotted-quad subnet mask to a prefix length, rejecting
/// non-contiguous masks.
pub fn mask_to_prefix(mask: Ipv4Addr) -> NetlinkResult<u8> {
    let bits = u32::from(mask);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(NetlinkError::InvalidMask {
            mask: mask.to_string(),
        });
    }
    Ok(prefix as u8)
}

fn spawn_handle() -> NetlinkResult<Handle> {
    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|source| NetlinkError::Socket { source })?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn lookup_link(handle: &Handle, name: &str) -> NetlinkResult<LinkMessage> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    links
        .try_next()
        .await
        .map_err(|e| NetlinkError::LinkLookup {
            name: name.to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| NetlinkError::LinkLookup {
            name: name.to_string(),
            message: "no such link".to_string(),
        })
}

fn hardware_address(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => Some(
            bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
        ),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mask_conversion() {
        assert_eq!(mask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)).unwrap(), 24);
        assert_eq!(mask_to_prefix(Ipv4Addr::new(255, 255, 255, 255)).unwrap(), 32);
        assert_eq!(mask_to_prefix(Ipv4Addr::new(255, 255, 0, 0)).unwrap(), 16);
        assert_eq!(mask_to_prefix(Ipv4Addr::new(0, 0, 0, 0)).unwrap(), 0);
    }

    #[test]
    fn non_contiguous_mask_is_rejected() {
        assert!(mask_to_prefix(Ipv4Addr::new(255, 0, 255, 0)).is_err());
        assert!(mask_to_prefix(Ipv4Addr::new(0, 255, 255, 255)).is_err());
    }

    #[test]
    fn mac_formatting() {
        let mut link = LinkMessage::default();
        link.attributes
            .push(LinkAttribute::Address(vec![0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]));
        assert_eq!(
            hardware_address(&link).as_deref(),
            Some("aa:bb:cc:00:11:22")
        );
        assert_eq!(hardware_address(&LinkMessage::default()), None);
    }
}
