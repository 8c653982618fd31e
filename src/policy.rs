//! Issuance and request policy.

use trust_dns_proto::rr::Name;

use crate::core::{Identifier, IDENTIFIER_DNS};
use crate::problem::Problem;

/// The JWS algorithms allowed by policy and standard.
pub fn allowed_jws_algorithms() -> Vec<&'static str> {
    vec!["ES256", "ES384", "ES512", "RS256"]
}

/// Checks that an order identifier is something we are willing to
/// authorize: a syntactically valid DNS name with no partial wildcards.
pub fn check_identifier(identifier: &Identifier) -> Result<(), Problem> {
    if identifier.id_type != IDENTIFIER_DNS {
        return Err(Problem::malformed(format!(
            "'{}' is not an identifier type we support",
            identifier.id_type
        )));
    }
    let name = Name::from_ascii(&identifier.value).map_err(|_| {
        Problem::malformed(format!("'{}' is not a valid DNS name", identifier.value))
    })?;
    for label in name.iter() {
        if label.contains(&b'*') && label != b"*" {
            return Err(Problem::malformed(
                "Partial wildcard identifiers are not supported",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_allowlist_is_fixed() {
        assert_eq!(allowed_jws_algorithms(), vec!["ES256", "ES384", "ES512", "RS256"]);
    }

    #[test]
    fn plain_dns_names_pass() {
        assert!(check_identifier(&Identifier::dns("example.test")).is_ok());
        assert!(check_identifier(&Identifier::dns("a.b.c.example.test")).is_ok());
    }

    #[test]
    fn non_dns_identifier_types_are_rejected() {
        let ident = Identifier {
            id_type: "ip".to_string(),
            value: "192.0.2.1".to_string(),
        };
        assert!(check_identifier(&ident).is_err());
    }

    #[test]
    fn partial_wildcards_are_rejected() {
        assert!(check_identifier(&Identifier::dns("w*ld.example.test")).is_err());
        assert!(check_identifier(&Identifier::dns("*.example.test")).is_ok());
    }

    #[test]
    fn garbage_names_are_rejected() {
        assert!(check_identifier(&Identifier::dns("exa mple")).is_err());
    }
}
