//! Per-query allow/deny policy lookups (component C5), grounded on
//! `original_source/Database.cpp::CheckPolicyList`.
//!
//! The query name is expanded into itself plus every parent-domain suffix,
//! and a single `COUNT(*)` query asks whether any of those suffixes has a
//! matching assignment for the query's network or owner. Allow is checked
//! before deny per spec.md §4.4/invariant 5 ("allow precedence").

use sqlx::{MySql, Pool};
use tracing::{instrument, trace};

use crate::enums::PolicyListKind;
use crate::error::DnsProxyError;
use crate::network::NetworkEntry;

/// Splits a trailing-dot query name into itself and every parent suffix,
/// per spec.md §6.1: `a.b.c.example.com.` → `["a.b.c.example.com",
/// "b.c.example.com", "c.example.com", "example.com", "com"]`.
pub fn domain_suffixes(qname: &str) -> Vec<String> {
    let trimmed = qname.strip_suffix('.').unwrap_or(qname);
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut suffixes = Vec::new();
    let mut rest = trimmed;
    loop {
        suffixes.push(rest.to_string());
        match rest.split_once('.') {
            Some((_, tail)) => rest = tail,
            None => break,
        }
    }
    suffixes
}

/// Runs the policy lookup query (spec.md §7, query 2) for one list kind and
/// returns whether any row matched.
#[instrument(skip(pool, network), fields(kind = %kind, qname))]
pub async fn check_policy_list(
    pool: &Pool<MySql>,
    kind: PolicyListKind,
    network: &NetworkEntry,
    qname: &str,
) -> Result<bool, DnsProxyError> {
    let suffixes = domain_suffixes(qname);
    if suffixes.is_empty() {
        return Ok(false);
    }

    let table = kind.table_name();
    let placeholders = suffixes.iter().map(|_| "pl.domain = ?").collect::<Vec<_>>().join(" OR ");

    let sql = format!(
        "SELECT COUNT(*) FROM policy_definition pd, policy_assignment pa, {table} pl \
         WHERE pl.policy = pd.object_id AND pa.policy = pd.object_id \
         AND ((pa.class = 'network' AND pa.target = ?) OR (pa.class = 'user' AND pa.target = ?)) \
         AND ({placeholders})"
    );

    let mut query = sqlx::query_scalar::<_, i64>(&sql)
        .bind(network.object_id)
        .bind(network.owner_id);
    for suffix in &suffixes {
        query = query.bind(suffix);
    }

    let count: i64 = query.fetch_one(pool).await?;
    trace!(count, "policy list checked");
    Ok(count > 0)
}

/// The full allow/deny decision for a parsed query, per spec.md §4.4/§6.1:
/// allow wins if present, otherwise deny blocks, otherwise the query is
/// forwarded. The deny list is never queried once allow has already hit.
pub async fn evaluate(
    pool: &Pool<MySql>,
    network: &NetworkEntry,
    qname: &str,
) -> Result<PolicyDecision, DnsProxyError> {
    let allow_hit = check_policy_list(pool, PolicyListKind::Allow, network, qname).await?;
    if allow_hit {
        return Ok(decide(true, false));
    }
    let deny_hit = check_policy_list(pool, PolicyListKind::Deny, network, qname).await?;
    Ok(decide(allow_hit, deny_hit))
}

/// The allow-before-deny precedence rule itself, pulled out of `evaluate` so
/// it can be exercised without a policy store connection.
fn decide(allow_hit: bool, deny_hit: bool) -> PolicyDecision {
    if allow_hit {
        PolicyDecision::Forward
    } else if deny_hit {
        PolicyDecision::Block
    } else {
        PolicyDecision::Forward
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Forward,
    Block,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_walk_down_to_tld() {
        let suffixes = domain_suffixes("a.b.c.example.com.");
        assert_eq!(
            suffixes,
            vec![
                "a.b.c.example.com",
                "b.c.example.com",
                "c.example.com",
                "example.com",
                "com",
            ]
        );
    }

    #[test]
    fn root_name_has_no_suffixes() {
        assert!(domain_suffixes(".").is_empty());
    }

    #[test]
    fn single_label_yields_itself_only() {
        assert_eq!(domain_suffixes("localhost.").to_vec(), vec!["localhost"]);
    }

    #[test]
    fn allow_wins_even_when_deny_also_matches() {
        assert_eq!(decide(true, true), PolicyDecision::Forward);
    }

    #[test]
    fn deny_blocks_when_allow_does_not_match() {
        assert_eq!(decide(false, true), PolicyDecision::Block);
    }

    #[test]
    fn neither_list_matching_forwards() {
        assert_eq!(decide(false, false), PolicyDecision::Forward);
    }
}
