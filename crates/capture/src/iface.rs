use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::{classify, Error};

/// A usable capture interface: its name and the local addresses bound to it.
/// Immutable after discovery; the addresses seed BPF derivation and label
/// per-interface counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addrs: Vec<IpAddr>,
}

/// Pick the set of interfaces to listen on.
///
/// With an explicit request, every named interface must resolve and accept a
/// capture handle; any failure aborts. With no request, enumerate all up
/// interfaces carrying at least one address, probe each, and keep the ones
/// that open. An empty result raises the first probe error, classified.
#[tracing::instrument]
pub fn discover(requested: &[String]) -> Result<BTreeMap<String, Interface>, Error> {
    let devices = pcap::Device::list()?;

    if !requested.is_empty() {
        let mut out = BTreeMap::new();
        for name in requested {
            let device = devices
                .iter()
                .find(|d| &d.name == name)
                .cloned()
                .ok_or_else(|| Error::InterfaceNotAvailable(name.clone()))?;
            probe(&device).map_err(|err| classify(name, err))?;
            out.insert(name.clone(), to_interface(device));
        }
        return Ok(out);
    }

    let mut out = BTreeMap::new();
    let mut first_err: Option<Error> = None;
    for device in devices {
        if !device.flags.if_flags.contains(pcap::IfFlags::UP) || device.addresses.is_empty() {
            continue;
        }
        match probe(&device) {
            Ok(()) => {
                out.insert(device.name.clone(), to_interface(device));
            }
            Err(err) => {
                tracing::warn!(iface = %device.name, error = %err, "skipping interface that failed a capture probe");
                if first_err.is_none() {
                    first_err = Some(classify(&device.name, err));
                }
            }
        }
    }

    if out.is_empty() {
        Err(first_err.unwrap_or(Error::NoInterfaces))
    } else {
        Ok(out)
    }
}

/// Briefly open a live handle to verify capture privilege on the device.
fn probe(device: &pcap::Device) -> Result<(), pcap::Error> {
    let cap = pcap::Capture::from_device(device.clone())?
        .snaplen(96)
        .timeout(100)
        .open()?;
    drop(cap);
    Ok(())
}

fn to_interface(device: pcap::Device) -> Interface {
    Interface {
        name: device.name,
        addrs: device.addresses.into_iter().map(|a| a.addr).collect(),
    }
}
