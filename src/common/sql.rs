// src/common/sql.rs
//
// Nomes de tabela/coluna não podem ser parâmetros ($1) no Postgres.
// Tudo que entra no texto SQL passa por `Ident`; valores são sempre bind.

use crate::common::error::AppError;

const MAX_IDENT_LEN: usize = 63;

/// Identificador SQL validado (`[a-z_][a-z0-9_]*`, até 63 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let mut chars = raw.chars();
        let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
        let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if !first_ok || !rest_ok || raw.len() > MAX_IDENT_LEN {
            return Err(AppError::Prerequisite(format!(
                "identificador SQL inválido: '{}'",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Forma entre aspas, pronta para o texto SQL.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl std::fmt::Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lista de colunas entre aspas separadas por vírgula.
pub fn column_list(columns: &[Ident]) -> String {
    columns
        .iter()
        .map(Ident::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case("escolas")]
    #[case("estoque_lotes_backup_20261016_101500")]
    #[case("_interna")]
    fn accepts_plain_identifiers(#[case] raw: &str) {
        let ident = Ident::parse(raw).unwrap();
        assert_eq!(ident.quoted(), format!("\"{raw}\""));
    }

    #[rstest]
    #[case("")]
    #[case("Escolas")]
    #[case("escolas; DROP TABLE tenants")]
    #[case("escolas\"--")]
    #[case("1escolas")]
    fn rejects_anything_that_could_break_out(#[case] raw: &str) {
        assert_matches!(Ident::parse(raw), Err(AppError::Prerequisite(_)));
    }

    #[test]
    fn rejects_names_longer_than_postgres_allows() {
        let raw = "a".repeat(MAX_IDENT_LEN + 1);
        assert!(Ident::parse(&raw).is_err());
        assert!(Ident::parse(&raw[..MAX_IDENT_LEN]).is_ok());
    }

    #[test]
    fn column_list_quotes_each_column() {
        let cols = vec![Ident::parse("id").unwrap(), Ident::parse("nome").unwrap()];
        assert_eq!(column_list(&cols), "\"id\", \"nome\"");
    }
}
