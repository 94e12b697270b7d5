use crate::model::{Service, ServiceProto};

// Ports worth advertising to peers for discovery. Anything else is noise:
// ephemeral ports, one-off dev servers, system daemons nobody browses to.
// File sharing (139/445) is included for the Samba case.
const INTERESTING_TCP_PORTS: &[u16] = &[22, 80, 139, 443, 445, 3389, 5900, 8080, 8443];

// On Windows these listen on every machine whether or not anything is being
// shared, so they say nothing about what the user is running.
const WINDOWS_NOISE_PORTS: &[u16] = &[135, 137, 139, 445];

/// Whether a discovered service is worth reporting to the control plane.
pub fn is_interesting_service(svc: &Service, os: &str) -> bool {
    if svc.proto != ServiceProto::Tcp {
        return false;
    }
    if os == "windows" && WINDOWS_NOISE_PORTS.contains(&svc.port) {
        return false;
    }
    INTERESTING_TCP_PORTS.contains(&svc.port)
}
