//! Size arbitration: one PTY geometry from many viewports.
//!
//! The effective size is the coordinate-wise minimum of the local terminal
//! and every connected client's last declared size, so every viewer can
//! display the whole screen.

use std::collections::HashMap;

use super::state::ClientId;

#[derive(Debug, Clone)]
pub struct SizeArbiter {
    local: (u16, u16),
    clients: HashMap<ClientId, (u16, u16)>,
}

impl SizeArbiter {
    pub fn new(local_cols: u16, local_rows: u16) -> Self {
        Self {
            local: (local_cols, local_rows),
            clients: HashMap::new(),
        }
    }

    /// Update the local terminal's size. Degenerate sizes are ignored.
    pub fn set_local(&mut self, cols: u16, rows: u16) {
        if cols > 0 && rows > 0 {
            self.local = (cols, rows);
        }
    }

    /// Record a client's declared size. Degenerate sizes are ignored.
    pub fn set_client(&mut self, id: ClientId, cols: u16, rows: u16) {
        if cols > 0 && rows > 0 {
            self.clients.insert(id, (cols, rows));
        }
    }

    /// Forget a disconnected client's size.
    pub fn remove_client(&mut self, id: ClientId) {
        self.clients.remove(&id);
    }

    pub fn clear_clients(&mut self) {
        self.clients.clear();
    }

    /// The size to apply, or `None` if it would be degenerate.
    pub fn effective(&self) -> Option<(u16, u16)> {
        let (cols, rows) = self
            .clients
            .values()
            .fold(self.local, |(c, r), &(cc, cr)| (c.min(cc), r.min(cr)));
        (cols > 0 && rows > 0).then_some((cols, rows))
    }
}
