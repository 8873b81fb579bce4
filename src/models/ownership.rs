// src/models/ownership.rs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---
// 1. Tipos de Entidade escopados por tenant
// ---
// Cada tipo sabe em qual tabela mora. Os nomes de tabela são fixos
// (nunca vêm de entrada do usuário).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Escola,
    Produto,
    Lote,
    Movimentacao,
    Estoque,
}

impl EntityKind {
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Escola => "escolas",
            EntityKind::Produto => "produtos",
            EntityKind::Lote => "estoque_lotes",
            EntityKind::Movimentacao => "estoque_movimentacoes",
            EntityKind::Estoque => "estoque_escolas",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Escola => "escola",
            EntityKind::Produto => "produto",
            EntityKind::Lote => "lote",
            EntityKind::Movimentacao => "movimentação",
            EntityKind::Estoque => "estoque",
        }
    }
}

// ---
// 2. Referência (tipo, id)
// ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind.label(), self.id)
    }
}

// ---
// 3. Modelo de posse: tabelas escopadas e FKs que precisam concordar no tenant
// ---

/// Uma FK de uma tabela escopada para outra tabela escopada.
/// `child.tenant_id` deve ser igual a `parent.tenant_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantForeignKey {
    pub column: &'static str,
    pub references: &'static str,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopedTable {
    pub name: &'static str,
    pub foreign_keys: &'static [TenantForeignKey],
}

impl ScopedTable {
    /// Tabelas que precisam ser migradas antes desta.
    pub fn dependencies(&self) -> Vec<&'static str> {
        let mut deps: Vec<&'static str> = Vec::new();
        for fk in self.foreign_keys {
            if fk.references != self.name && !deps.contains(&fk.references) {
                deps.push(fk.references);
            }
        }
        deps
    }

    /// FKs obrigatórias (NOT NULL): usadas para inferir o tenant de uma linha
    /// filha no modo de correção do auditor.
    pub fn required_foreign_keys(&self) -> Vec<&'static TenantForeignKey> {
        self.foreign_keys.iter().filter(|fk| !fk.nullable).collect()
    }
}

const FK_ESCOLA: TenantForeignKey = TenantForeignKey {
    column: "escola_id",
    references: "escolas",
    nullable: false,
};

const FK_PRODUTO: TenantForeignKey = TenantForeignKey {
    column: "produto_id",
    references: "produtos",
    nullable: false,
};

/// Todas as tabelas com coluna tenant_id, na ordem de declaração.
pub const SCOPED_TABLES: &[ScopedTable] = &[
    ScopedTable {
        name: "escolas",
        foreign_keys: &[],
    },
    ScopedTable {
        name: "produtos",
        foreign_keys: &[],
    },
    ScopedTable {
        name: "estoque_escolas",
        foreign_keys: &[FK_ESCOLA, FK_PRODUTO],
    },
    ScopedTable {
        name: "estoque_lotes",
        foreign_keys: &[FK_ESCOLA, FK_PRODUTO],
    },
    ScopedTable {
        name: "estoque_movimentacoes",
        foreign_keys: &[
            TenantForeignKey {
                column: "lote_id",
                references: "estoque_lotes",
                nullable: true,
            },
            FK_ESCOLA,
            FK_PRODUTO,
        ],
    },
    ScopedTable {
        name: "estoque_historico",
        foreign_keys: &[FK_ESCOLA, FK_PRODUTO],
    },
];

pub fn scoped_table(name: &str) -> Option<&'static ScopedTable> {
    SCOPED_TABLES.iter().find(|t| t.name == name)
}

/// Ordem de migração: dependências primeiro, empates na ordem de declaração.
/// O grafo é o declarado acima; não é inferido do schema.
pub fn migration_order() -> Vec<&'static str> {
    order_tables(SCOPED_TABLES)
}

pub(crate) fn order_tables(tables: &[ScopedTable]) -> Vec<&'static str> {
    let mut ordered: Vec<&'static str> = Vec::with_capacity(tables.len());
    let mut pending: Vec<&ScopedTable> = tables.iter().collect();

    while !pending.is_empty() {
        let ready = pending.iter().position(|t| {
            t.dependencies()
                .iter()
                // Dependências fora do conjunto não bloqueiam.
                .all(|dep| ordered.contains(dep) || !tables.iter().any(|x| x.name == *dep))
        });

        match ready {
            Some(idx) => ordered.push(pending.remove(idx).name),
            None => {
                tracing::warn!(
                    "Ciclo de dependências entre tabelas escopadas: {:?}",
                    pending.iter().map(|t| t.name).collect::<Vec<_>>()
                );
                ordered.extend(pending.drain(..).map(|t| t.name));
            }
        }
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[&str], name: &str) -> usize {
        order.iter().position(|t| *t == name).unwrap()
    }

    #[test]
    fn every_dependency_is_migrated_first() {
        let order = migration_order();
        assert_eq!(order.len(), SCOPED_TABLES.len());

        for table in SCOPED_TABLES {
            for dep in table.dependencies() {
                assert!(
                    position(&order, dep) < position(&order, table.name),
                    "{dep} deveria vir antes de {}",
                    table.name
                );
            }
        }
    }

    #[test]
    fn movements_depend_on_lots_and_come_after_them() {
        let movs = scoped_table("estoque_movimentacoes").unwrap();
        assert_eq!(
            movs.dependencies(),
            vec!["estoque_lotes", "escolas", "produtos"]
        );

        let required: Vec<_> = movs.required_foreign_keys().iter().map(|fk| fk.column).collect();
        assert_eq!(required, vec!["escola_id", "produto_id"]);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        const TABLES: &[ScopedTable] = &[
            ScopedTable {
                name: "filha",
                foreign_keys: &[TenantForeignKey {
                    column: "mae_id",
                    references: "mae",
                    nullable: false,
                }],
            },
            ScopedTable {
                name: "mae",
                foreign_keys: &[],
            },
            ScopedTable {
                name: "avulsa",
                foreign_keys: &[],
            },
        ];

        assert_eq!(order_tables(TABLES), vec!["mae", "filha", "avulsa"]);
    }

    #[test]
    fn entity_kinds_map_to_registered_tables() {
        for kind in [
            EntityKind::Escola,
            EntityKind::Produto,
            EntityKind::Lote,
            EntityKind::Movimentacao,
            EntityKind::Estoque,
        ] {
            assert!(scoped_table(kind.table()).is_some(), "{:?}", kind);
        }
        assert!(scoped_table("tenants").is_none());
    }
}
