// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rendered-screen snapshot backed by an avt virtual terminal.
//!
//! The session feeds only safe-boundary chunks (see [`crate::boundary`]),
//! so no partial-scalar or partial-escape buffering is needed here.

/// Opaque terminal screen kept alongside the scrollback ring so that a
/// fresh attach can show the current frame without replaying history.
pub struct Screen {
    vt: avt::Vt,
}

impl Screen {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { vt: avt::Vt::new(cols as usize, rows as usize) }
    }

    /// Feed a safe-boundary chunk into the virtual terminal.
    pub fn feed(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let s = String::from_utf8_lossy(data);
        let _ = self.vt.feed_str(&s);
    }

    /// Current screen contents as one string per row.
    pub fn lines(&self) -> Vec<String> {
        self.vt.view().map(|line| line.text()).collect()
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        let _ = self.vt.resize(cols as usize, rows as usize);
    }
}

impl std::fmt::Debug for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screen").finish()
    }
}
