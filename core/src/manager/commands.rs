//! Command dispatch, cursor movement, and the sliding-window policy.

use tracing::{debug, warn};

use crate::archive::{self, OpenTrigger};
use crate::types::{Command, JumpTarget, UserCommand};

use super::{Manager, PageIndices};

impl Manager {
    pub(super) fn handle_user_command(&mut self, command: UserCommand) {
        debug!("handling {:?}", command.command);
        let result = self.dispatch_command(command.command);
        if let Some(responder) = command.responder {
            let _ = responder.send(result);
        }
    }

    pub(super) fn dispatch_command(&mut self, command: Command) -> Result<(), String> {
        match command {
            Command::NextPage => {
                self.move_pages(1);
                Ok(())
            }
            Command::PreviousPage => {
                self.move_pages(-1);
                Ok(())
            }
            Command::FirstPage => {
                self.first_page();
                Ok(())
            }
            Command::LastPage => {
                self.last_page();
                Ok(())
            }
            Command::NextArchive => {
                self.next_archive();
                Ok(())
            }
            Command::PreviousArchive => {
                self.previous_archive();
                Ok(())
            }
            Command::ToggleManga => {
                self.toggle_manga();
                Ok(())
            }
            Command::ToggleUpscaling => self.toggle_upscaling(),
            Command::Jump(target) => {
                self.jump(target);
                Ok(())
            }
        }
    }

    fn move_pages(&mut self, delta: isize) {
        let (next, valid) = self.add(self.current, delta);
        if !valid {
            return;
        }
        if !self.modes.manga && next.a != self.current.a {
            return;
        }
        let old = self.current;
        self.current = next;
        self.after_move(old);
    }

    fn first_page(&mut self) {
        let old = self.current;
        self.current.p = 0;
        if old != self.current {
            self.after_move(old);
        }
    }

    fn last_page(&mut self) {
        let old = self.current;
        let count = self.archives[self.current.a].page_count();
        self.current.p = (count as isize - 1).max(0);
        if old != self.current {
            self.after_move(old);
        }
    }

    fn next_archive(&mut self) {
        if self.current.a == self.archives.len() - 1
            && self.open_next_archive(OpenTrigger::WaitingOnFirst).is_none()
        {
            return;
        }

        let old = self.current;
        self.current = PageIndices { a: old.a + 1, p: 0 };
        self.after_move(old);
    }

    fn previous_archive(&mut self) {
        if self.current.a == 0 && self.open_previous_archive(OpenTrigger::WaitingOnFirst).is_none()
        {
            return;
        }

        let old = self.current;
        self.current = PageIndices { a: old.a - 1, p: 0 };
        self.after_move(old);
    }

    fn toggle_manga(&mut self) {
        self.modes.manga = !self.modes.manga;
        self.reset_work_cursors();
    }

    fn toggle_upscaling(&mut self) -> Result<(), String> {
        if !self.modes.upscaling && !self.upscaling_available() {
            return Err("upscaling is not configured".to_string());
        }
        self.modes.upscaling = !self.modes.upscaling;
        self.reset_work_cursors();
        Ok(())
    }

    fn jump(&mut self, target: JumpTarget) {
        match target {
            JumpTarget::Absolute(page) => {
                let count = self.archives[self.current.a].page_count();
                if count == 0 {
                    return;
                }
                let old = self.current;
                self.current.p = (page as isize - 1).min(count as isize - 1).max(0);
                if old != self.current {
                    self.after_move(old);
                }
            }
            JumpTarget::Forward(n) => self.jump_relative(n, 1),
            JumpTarget::Backward(n) => self.jump_relative(n, -1),
        }
    }

    /// Relative jumps clamp at whatever boundary movement stops at.
    fn jump_relative(&mut self, n: usize, direction: isize) {
        let old = self.current;
        for _ in 0..n {
            let (next, valid) = self.add(self.current, direction);
            if !valid || (!self.modes.manga && next.a != self.current.a) {
                break;
            }
            self.current = next;
        }
        if old != self.current {
            self.after_move(old);
        }
    }

    /// Restarts the work cursors from the displayed page, typically after a
    /// mode change or resize.
    pub(super) fn reset_work_cursors(&mut self) {
        self.nl = self.current;
        self.nu = self.current;
        self.find_next_image_to_load();
    }

    /// Eviction and retention after the current cursor moved away from
    /// `old`: pages that slid out of the preload window are unloaded, then
    /// archives no longer inside any retained window are closed.
    pub(super) fn after_move(&mut self, old: PageIndices) {
        self.nl = self.current;
        self.nu = self.current;
        self.find_next_image_to_load();

        let behind = self.cfg.preload_behind as isize;
        let ahead = self.cfg.preload_ahead as isize;

        // Trailing edge: [old - behind, current - behind).
        let (from, _) = self.add(old, -behind);
        let (to, _) = self.add(self.current, -behind);
        self.evict_range(from, to);

        // Leading edge: (current + ahead, old + ahead].
        let (from, _) = self.add(self.current, ahead + 1);
        let (to, _) = self.add(old, ahead + 1);
        self.evict_range(from, to);

        self.touch_current_upscaled();
        self.close_unused_archives();
    }

    /// Unloads every valid page in `[from, to)`.
    fn evict_range(&mut self, from: PageIndices, to: PageIndices) {
        let mut cursor = from;
        while cursor < to {
            if let Some(page) = self.page_mut(cursor) {
                page.unload();
            }
            let (next, _) = self.add(cursor, 1);
            if next == cursor {
                break;
            }
            cursor = next;
        }
    }

    /// Closes archives that left both the loading window and the work
    /// cursors, migrating indices when the list shrinks at the front.
    fn close_unused_archives(&mut self) {
        let behind = self.cfg.preload_behind as isize;
        let ahead = self.cfg.preload_ahead as isize;
        let (mut start, _) = self.add(self.current, -behind);
        let (mut end, _) = self.add(self.current, ahead);

        loop {
            let last = self.archives.len() - 1;
            if last == 0
                || self.current.a == last
                || start.a == last
                || end.a == last
                || self.nl.a == last
                || self.nu.a == last
            {
                break;
            }
            let archive = self.archives.pop_back().expect("len checked");
            self.forget_upscaled(archive.id());
            debug!("closing {archive:?}");
            self.closing.push(archive.close());
        }

        while self.archives.len() > 1
            && self.current.a > 0
            && start.a > 0
            && end.a > 0
            && self.nl.a > 0
            && self.nu.a > 0
        {
            let archive = self.archives.pop_front().expect("len checked");
            self.forget_upscaled(archive.id());
            debug!("closing {archive:?}");
            self.closing.push(archive.close());

            self.current.a -= 1;
            self.nl.a -= 1;
            self.nu.a -= 1;
            start.a -= 1;
            end.a -= 1;
        }
    }

    /// Advances `nl` to the next page that wants a load, parking it on the
    /// current page when there is nothing to do. Forward first, then
    /// backward; archive boundaries are crossed only in manga mode, and
    /// backward only when upscaling permits revisiting earlier chapters.
    pub(super) fn find_next_image_to_load(&mut self) {
        let upscaling = self.modes.upscaling;

        let (mut last_preload, _) = self.add(self.current, self.cfg.preload_ahead as isize);
        if self.current <= self.nl {
            while self.nl <= last_preload {
                if let Some(page) = self.page(self.nl) {
                    if page.can_load(upscaling).0 {
                        return;
                    }
                }
                let (next, valid) = self.add(self.nl, 1);
                if valid {
                    if next.a != self.current.a && !self.modes.manga {
                        break;
                    }
                    self.nl = next;
                } else if self.modes.manga
                    && self.open_next_archive(OpenTrigger::Preloading).is_some()
                {
                    // The window may now extend into the new archive.
                    last_preload = self.add(self.current, self.cfg.preload_ahead as isize).0;
                } else {
                    break;
                }
            }
            self.nl = self.current;
        }

        let may_cross_backward =
            self.modes.manga && (!upscaling || self.cfg.upscale_previous_chapters);

        let (mut first_preload, _) = self.add(self.current, -(self.cfg.preload_behind as isize));
        while first_preload <= self.nl {
            if let Some(page) = self.page(self.nl) {
                if page.can_load(upscaling).0 {
                    return;
                }
            }
            let (next, valid) = self.add(self.nl, -1);
            if valid {
                if next.a != self.current.a && !may_cross_backward {
                    break;
                }
                self.nl = next;
            } else if may_cross_backward
                && self.open_previous_archive(OpenTrigger::Preloading).is_some()
            {
                first_preload = self.add(self.current, -(self.cfg.preload_behind as isize)).0;
            } else {
                break;
            }
        }

        // Nothing to do; park on the current page.
        self.nl = self.current;
    }

    /// Opens the natural-order successor archive, appending it to the list.
    pub(super) fn open_next_archive(&mut self, trigger: OpenTrigger) -> Option<usize> {
        let last = self.archives.back().expect("archive list is never empty");
        let path = archive::neighbor_path(last, true)?;
        match archive::open_archive(&path, &self.temp_root, trigger) {
            Ok((archive, _)) => {
                debug!("opened next archive {archive:?}");
                self.archives.push_back(archive);
                Some(self.archives.len() - 1)
            }
            Err(err) => {
                // Expansion in this direction silently stops.
                warn!("failed to open next archive {}: {err:#}", path.display());
                None
            }
        }
    }

    /// Opens the predecessor archive at the front, shifting every cursor.
    pub(super) fn open_previous_archive(&mut self, trigger: OpenTrigger) -> Option<usize> {
        let first = self.archives.front().expect("archive list is never empty");
        let path = archive::neighbor_path(first, false)?;
        match archive::open_archive(&path, &self.temp_root, trigger) {
            Ok((archive, _)) => {
                debug!("opened previous archive {archive:?}");
                self.archives.push_front(archive);
                self.current.a += 1;
                self.nl.a += 1;
                self.nu.a += 1;
                Some(0)
            }
            Err(err) => {
                warn!("failed to open previous archive {}: {err:#}", path.display());
                None
            }
        }
    }
}
