//! Canais de eventos tipados do nó
//!
//! Substitui emissão de eventos por callbacks: cada classe de evento é
//! uma variante de um canal broadcast limitado; consumidores assinam e
//! podem aplicar backpressure simplesmente não consumindo.

use shared::Hash256;
use tokio::sync::broadcast;

/// Capacidade do canal de eventos
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Eventos observáveis do nó
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Um bloco foi minerado localmente
    BlockMined { hash: Hash256, height: u64 },
    /// Um bloco foi anexado à cadeia ativa
    BlockAppended { hash: Hash256, height: u64 },
    /// Uma reorganização foi concluída
    ReorgCompleted {
        old_tip: Hash256,
        new_tip: Hash256,
        ancestor_height: u64,
    },
    /// Sincronização concluída até a altura dada
    SyncCompleted { height: u64 },
    /// Falha de sincronização
    SyncError { reason: String },
}

/// Par emissor/assinatura do barramento de eventos
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Assina o barramento
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    /// Publica um evento; sem assinantes o evento é descartado
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
