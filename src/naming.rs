// DNS labels for discovered services

use anyhow::{Result, anyhow};
use std::collections::HashSet;
use std::path::Path;

/// DNS label for a service: the base name of its program path, converted to
/// its ASCII-compatible (punycode) form.
///
/// Services nobody could be attributed to are named after their port.
pub fn service_label(command: Option<&str>, port: u16) -> Result<String> {
    let base = command
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty());

    let Some(base) = base else {
        return Ok(format!("port-{}", port));
    };

    idna::domain_to_ascii(&base)
        .map_err(|err| anyhow!("Cannot turn {:?} into a DNS label: {:?}", base, err))
}

/// Labels handed out during one provisioning pass
#[derive(Debug, Default)]
pub struct NameRegistry {
    taken: HashSet<String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `label`, or the first free `label.2`, `label.3`, ...
    pub fn claim(&mut self, label: &str) -> String {
        if self.taken.insert(label.to_string()) {
            return label.to_string();
        }
        let mut n = 2u32;
        loop {
            let candidate = format!("{}.{}", label, n);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.taken.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }
}
