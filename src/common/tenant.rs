// src/common/tenant.rs

use uuid::Uuid;

// O tenant de quem está chamando.
// Resolvido uma vez por requisição a partir do usuário autenticado (camada de
// auth, fora deste crate). Nenhum payload de requisição deste crate tem campo
// tenant_id: o único caminho para o tenant é este tipo, passado explicitamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TenantContext(pub Uuid);

impl TenantContext {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
