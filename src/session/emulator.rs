// ABOUTME: Headless terminal emulator backing one session
// Processes ANSI output through a VT100 parser and manages scroll state;
// rendering is the embedding UI's job

use std::collections::VecDeque;

/// Upper bound on retained emulator lines.
const MAX_SCROLLBACK_LINES: usize = 10_000;

pub struct TerminalEmulator {
    parser: vt100::Parser,
    cols: u16,
    rows: u16,

    /// Completed lines that scrolled off the live screen.
    scrollback: VecDeque<String>,
    /// Partial trailing line of the last processed chunk.
    pending_line: String,

    /// 0 = bottom/latest.
    scroll_offset: usize,

    selection_start: Option<(u16, u16)>,
    selection_end: Option<(u16, u16)>,
}

impl TerminalEmulator {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, 0),
            cols,
            rows,
            scrollback: VecDeque::new(),
            pending_line: String::new(),
            scroll_offset: 0,
            selection_start: None,
            selection_end: None,
        }
    }

    /// Feed raw PTY output into the emulator.
    pub fn process_output(&mut self, data: &str) {
        self.parser.process(data.as_bytes());

        // Track completed lines for scrollback independent of the live
        // screen; the parser only retains the visible grid.
        for chunk in data.split_inclusive('\n') {
            self.pending_line.push_str(chunk.trim_end_matches(['\r', '\n']));
            if chunk.ends_with('\n') {
                let line = std::mem::take(&mut self.pending_line);
                self.scrollback.push_back(line);
                while self.scrollback.len() > MAX_SCROLLBACK_LINES {
                    self.scrollback.pop_front();
                }
            }
        }

        // New output snaps the view back to the bottom.
        self.scroll_offset = 0;
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        self.parser.set_size(rows, cols);
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn clear(&mut self) {
        self.parser = vt100::Parser::new(self.rows, self.cols, 0);
        self.scrollback.clear();
        self.pending_line.clear();
        self.scroll_offset = 0;
        self.selection_start = None;
        self.selection_end = None;
    }

    /// Text contents of the live screen.
    pub fn screen_contents(&self) -> String {
        self.parser.screen().contents()
    }

    pub fn cursor_position(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    pub fn scroll_up(&mut self, n: usize) {
        let max_scroll = self.scrollback.len();
        self.scroll_offset = (self.scroll_offset + n).min(max_scroll);
    }

    pub fn scroll_down(&mut self, n: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(n);
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll_offset = self.scrollback.len();
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_offset = 0;
    }

    pub fn is_at_bottom(&self) -> bool {
        self.scroll_offset == 0
    }

    /// Lines visible at the current scroll position: scrollback when
    /// scrolled up, the live screen otherwise.
    pub fn visible_lines(&self) -> Vec<String> {
        if self.scroll_offset == 0 {
            return self
                .screen_contents()
                .lines()
                .map(str::to_string)
                .collect();
        }

        let total = self.scrollback.len();
        let end = total - self.scroll_offset.min(total);
        let start = end.saturating_sub(self.rows as usize);
        self.scrollback
            .iter()
            .skip(start)
            .take(end - start)
            .cloned()
            .collect()
    }

    pub fn start_selection(&mut self, col: u16, row: u16) {
        self.selection_start = Some((col, row));
        self.selection_end = Some((col, row));
    }

    pub fn update_selection(&mut self, col: u16, row: u16) {
        if self.selection_start.is_some() {
            self.selection_end = Some((col, row));
        }
    }

    pub fn clear_selection(&mut self) {
        self.selection_start = None;
        self.selection_end = None;
    }

    /// Text between the selection anchors on the live screen, inclusive,
    /// walked cell by cell.
    pub fn selected_text(&self) -> Option<String> {
        let (start, end) = match (self.selection_start, self.selection_end) {
            (Some(start), Some(end)) => (start, end),
            _ => return None,
        };

        // Normalize so start precedes end in reading order.
        let (start, end) = if (start.1, start.0) <= (end.1, end.0) {
            (start, end)
        } else {
            (end, start)
        };

        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let mut text = String::new();

        for row in start.1..=end.1.min(rows.saturating_sub(1)) {
            let first_col = if row == start.1 { start.0 } else { 0 };
            let last_col = if row == end.1 {
                end.0.min(cols.saturating_sub(1))
            } else {
                cols.saturating_sub(1)
            };

            let mut line = String::new();
            for col in first_col..=last_col {
                if let Some(cell) = screen.cell(row, col) {
                    line.push_str(&cell.contents());
                }
            }
            if row != start.1 {
                text.push('\n');
            }
            text.push_str(line.trim_end());
        }

        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn processes_output_onto_the_screen() {
        let mut emulator = TerminalEmulator::new(80, 24);
        emulator.process_output("hello world\r\n");
        assert!(emulator.screen_contents().contains("hello world"));
    }

    #[test]
    fn scrollback_accumulates_completed_lines() {
        let mut emulator = TerminalEmulator::new(80, 24);
        emulator.process_output("one\r\ntwo\r\npartial");
        assert_eq!(emulator.scrollback_len(), 2);

        emulator.process_output(" done\r\n");
        assert_eq!(emulator.scrollback_len(), 3);
    }

    #[test]
    fn scroll_positions_clamp_to_buffer() {
        let mut emulator = TerminalEmulator::new(80, 4);
        for i in 0..10 {
            emulator.process_output(&format!("line {i}\r\n"));
        }

        emulator.scroll_to_top();
        assert!(!emulator.is_at_bottom());

        emulator.scroll_down(1_000);
        assert!(emulator.is_at_bottom());

        emulator.scroll_up(3);
        emulator.scroll_to_bottom();
        assert!(emulator.is_at_bottom());
    }

    #[test]
    fn new_output_snaps_back_to_bottom() {
        let mut emulator = TerminalEmulator::new(80, 4);
        for i in 0..10 {
            emulator.process_output(&format!("line {i}\r\n"));
        }
        emulator.scroll_to_top();
        emulator.process_output("fresh\r\n");
        assert!(emulator.is_at_bottom());
    }

    #[test]
    fn selection_extracts_screen_text() {
        let mut emulator = TerminalEmulator::new(80, 24);
        emulator.process_output("abcdef");
        emulator.start_selection(1, 0);
        emulator.update_selection(3, 0);
        assert_eq!(emulator.selected_text().as_deref(), Some("bcd"));

        emulator.clear_selection();
        assert_eq!(emulator.selected_text(), None);
    }

    #[test]
    fn clear_resets_everything() {
        let mut emulator = TerminalEmulator::new(80, 24);
        emulator.process_output("data\r\n");
        emulator.clear();
        assert_eq!(emulator.scrollback_len(), 0);
        assert_eq!(emulator.screen_contents().trim(), "");
    }

    #[test]
    fn resize_propagates_to_the_parser() {
        let mut emulator = TerminalEmulator::new(80, 24);
        emulator.resize(120, 40);
        assert_eq!(emulator.size(), (120, 40));
    }
}
