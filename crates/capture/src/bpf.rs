use std::collections::BTreeMap;

use crate::{Error, Interface};

/// Derived filters for one interface. An empty inbound expression means
/// "match all"; in that case no outbound filter exists because direction
/// cannot be distinguished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPair {
    pub inbound: String,
    pub outbound: Option<String>,
}

/// Derive per-interface inbound/outbound BPF expressions.
///
/// A user-supplied expression is taken verbatim as the inbound filter on
/// every interface, and combining it with a port filter is a user error.
/// With only a port, the inbound filter is the disjunction over the
/// interface's local addresses of src/dst matches on that port. The outbound
/// filter is the textual negation of a non-empty inbound filter, skipped
/// entirely when `create_outbound` is false.
pub fn make_filters(
    ifaces: &BTreeMap<String, Interface>,
    user_bpf: Option<&str>,
    port: Option<u16>,
    create_outbound: bool,
) -> Result<BTreeMap<String, FilterPair>, Error> {
    if user_bpf.is_some() && port.is_some() {
        return Err(Error::ConflictingFilters);
    }

    let mut out = BTreeMap::new();
    for (name, iface) in ifaces {
        let inbound = match (user_bpf, port) {
            (Some(expr), _) => expr.to_string(),
            (None, Some(port)) => port_filter(iface, port),
            (None, None) => String::new(),
        };
        let outbound = if create_outbound && !inbound.is_empty() {
            Some(format!("not ({})", inbound))
        } else {
            None
        };
        out.insert(
            name.clone(),
            FilterPair { inbound, outbound },
        );
    }
    Ok(out)
}

fn port_filter(iface: &Interface, port: u16) -> String {
    let clauses: Vec<String> = iface
        .addrs
        .iter()
        .map(|ip| {
            format!(
                "(src host {ip} and src port {port}) or (dst host {ip} and dst port {port})"
            )
        })
        .collect();
    clauses.join(" or ")
}
