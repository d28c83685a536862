use crate::error::MonitorError;
use crate::store::domains::DomainRepository;
use crate::store::Database;

/// Interns domain strings and their parent-domain derivation.
pub struct DomainCatalog {
    db: Database,
}

impl DomainCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Normalizes and interns a domain, returning `(domain_id, parent)`.
    pub async fn intern(&self, raw: &str, now: i64) -> Result<(i64, String), MonitorError> {
        let fqdn = normalize(raw)?;
        let parent = parent_of(&fqdn);

        let parent_for_db = parent.clone();
        let fqdn_for_db = fqdn.clone();
        let domain_id = self
            .db
            .execute(move |conn| {
                DomainRepository::new(conn).intern(&fqdn_for_db, &parent_for_db, now)
            })
            .await
            .map_err(|e| MonitorError::TransientIo(format!("domain intern: {e}")))?;

        Ok((domain_id, parent))
    }
}

/// Normalizes a raw domain string: lowercase, trimmed, URL furniture
/// (scheme, path, query, fragment, port) stripped, one trailing dot
/// removed. Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> Result<String, MonitorError> {
    let mut domain = raw.trim().to_ascii_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = domain.strip_prefix(scheme) {
            domain = rest.to_string();
            break;
        }
    }

    // Keep only the host part of anything URL-shaped.
    for sep in ['/', '?', '#', ':'] {
        if let Some(idx) = domain.find(sep) {
            domain.truncate(idx);
        }
    }

    if let Some(stripped) = domain.strip_suffix('.') {
        domain = stripped.to_string();
    }

    if domain.is_empty() {
        return Err(MonitorError::validation("domain must not be empty"));
    }

    if domain
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(MonitorError::validation(format!(
            "domain contains invalid characters: {domain:?}"
        )));
    }

    Ok(domain)
}

/// Derives the parent (registrable) domain with the suffix-free 2-label
/// heuristic: two or fewer labels are their own parent, otherwise the
/// last two labels. `bbc.co.uk` therefore maps to `co.uk`; that is the
/// documented, tested behavior. Idempotent.
pub fn parent_of(fqdn: &str) -> String {
    let labels: Vec<&str> = fqdn.split('.').collect();
    if labels.len() <= 2 {
        return fqdn.to_string();
    }
    format!("{}.{}", labels[labels.len() - 2], labels[labels.len() - 1])
}
