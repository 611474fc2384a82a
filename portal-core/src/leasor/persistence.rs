use std::path::Path;

use prost::Message;

use crate::error::{ProxyError, Result};
use crate::rpc::pb;

use super::state::Registration;

/// The full thing written to `save_file` on every mutation: the ordered
/// registration set plus the root-CA bundle used for mTLS to backends.
pub struct PersistedState {
    pub registrations: Vec<Registration>,
    pub root_certs: Vec<Vec<u8>>,
}

/// Serialize and atomically write `state` to `path`.
///
/// Uses the write-then-rename dance (write to `<path>.tmp`, `fsync`,
/// rename over the target) as a crash-atomicity strengthening over the
/// "rewrite in place" the source does; see SPEC_FULL.md §9.
pub fn save(path: &Path, state: &PersistedState) -> Result<()> {
    let proto = pb::PersistedState {
        registrations: state.registrations.iter().map(Registration::to_proto).collect(),
        root_certs: state.root_certs.clone(),
    };
    let bytes = proto.encode_to_vec();

    let tmp_path = tmp_path_for(path);
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        use std::io::Write;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir_file) = std::fs::File::open(dir) {
            let _ = dir_file.sync_all();
        }
    }
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Load and decode `path`. Returns `Ok(None)` if the file does not exist
/// yet (first run).
pub fn load(path: &Path) -> Result<Option<PersistedState>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    let proto = pb::PersistedState::decode(bytes.as_slice())
        .map_err(|e| ProxyError::CorruptState(e.to_string()))?;

    let registrations = proto
        .registrations
        .into_iter()
        .map(Registration::try_from_proto)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::CorruptState(e.to_string()))?;

    Ok(Some(PersistedState { registrations, root_certs: proto.root_certs }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leasor::pattern::Pattern;
    use crate::leasor::state::{Lease, RegisterRequest};
    use std::time::SystemTime;

    fn sample_registration(pattern: &str, port: u16) -> Registration {
        Registration {
            request: RegisterRequest {
                pattern: Pattern::parse(pattern).unwrap(),
                fixed_port: 0,
                strip_pattern: false,
                certificate_request: None,
                hostname: None,
            },
            lease: Lease {
                pattern: Pattern::parse(pattern).unwrap(),
                port,
                timeout: SystemTime::now(),
                certificate: None,
            },
            client_addr: "10.0.0.1:443".to_string(),
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        let state = PersistedState {
            registrations: vec![sample_registration("/a/", 9100), sample_registration("/b", 9101)],
            root_certs: vec![vec![1, 2, 3]],
        };
        save(&path, &state).unwrap();

        let loaded = load(&path).unwrap().expect("file should exist");
        assert_eq!(loaded.registrations.len(), 2);
        assert_eq!(loaded.root_certs, vec![vec![1, 2, 3]]);
        assert_eq!(loaded.registrations[0].lease.port, 9100);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(load(&path).unwrap().is_none());
    }
}
