//! Seguridad de identificadores derivados de input de usuario.
//!
//! Todo identificador que termina en DDL (nombres de esquema y tablas de
//! packs) pasa por `validate_ident` y se interpola sólo citado con
//! `quote_ident`. La clase de caracteres es fija: `[a-z_][a-z0-9_]*`, largo
//! máximo 63 (límite de identificador de Postgres).

use crate::errors::DomainError;

pub const MAX_IDENT_LEN: usize = 63;

/// Valida un identificador contra la clase fija. Falla con
/// `DomainError::InvalidIdentifier` (kind `invalid_identifier` en la API).
pub fn validate_ident(ident: &str) -> Result<(), DomainError> {
    if ident.is_empty() || ident.len() > MAX_IDENT_LEN {
        return Err(DomainError::InvalidIdentifier(format!("largo fuera de rango (1..={MAX_IDENT_LEN}): {ident:?}")));
    }
    let mut chars = ident.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_lowercase() || first == '_') {
        return Err(DomainError::InvalidIdentifier(format!("debe comenzar con [a-z_]: {ident:?}")));
    }
    if !ident.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(DomainError::InvalidIdentifier(format!("caracteres fuera de [a-z0-9_]: {ident:?}")));
    }
    Ok(())
}

/// Cita un identificador ya validado para interpolarlo en DDL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// Deriva el nombre de esquema de un pack: `pack_<ref normalizado>`.
///
/// La parte de versión (`@v1`) no participa; el resto se baja a minúsculas y
/// todo carácter fuera de `[a-z0-9]` colapsa a `_`. El resultado se valida
/// antes de devolverse.
pub fn schema_name_for_pack(pack_ref: &str) -> Result<String, DomainError> {
    let name_part = pack_ref.split('@').next().unwrap_or("");
    if name_part.is_empty() {
        return Err(DomainError::InvalidIdentifier(format!("pack_ref vacío: {pack_ref:?}")));
    }
    let mut normalized = String::with_capacity(name_part.len() + 5);
    normalized.push_str("pack_");
    for c in name_part.chars() {
        let lower = c.to_ascii_lowercase();
        if lower.is_ascii_lowercase() || lower.is_ascii_digit() {
            normalized.push(lower);
        } else {
            normalized.push('_');
        }
    }
    validate_ident(&normalized)?;
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_name_from_pack_ref() {
        assert_eq!(schema_name_for_pack("core.domain@v1").unwrap(), "pack_core_domain");
        assert_eq!(schema_name_for_pack("test.locking@v1").unwrap(), "pack_test_locking");
        assert_eq!(schema_name_for_pack("Mixed-Case.Ref@v2").unwrap(), "pack_mixed_case_ref");
    }

    #[test]
    fn rejects_hostile_identifiers() {
        assert!(validate_ident("pack_x; drop table runs").is_err());
        assert!(validate_ident("Pack_X").is_err());
        assert!(validate_ident("").is_err());
        assert!(validate_ident(&"a".repeat(64)).is_err());
        assert!(validate_ident("1pack").is_err());
        assert!(validate_ident(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn quote_wraps_in_double_quotes() {
        assert_eq!(quote_ident("pack_core_domain"), "\"pack_core_domain\"");
    }
}
