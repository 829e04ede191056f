//! Delete, change attributes and directory exploration.

use super::*;
use crate::engine::listing_cache::ListingQuery;
use crate::engine::queue::NewItem;

impl Run<'_, '_> {
    pub(super) fn start_simple(&mut self) {
        if matches!(self.job.item.kind, ItemType::ChAttrsFile | ItemType::ChAttrsDir) && self.job.item.attrs.is_none() {
            return self.fail(ProblemCode::UnableToChangeAttrs, None, Some("no attributes given".into()));
        }
        let verb = match self.job.item.kind {
            ItemType::ChAttrsFile | ItemType::ChAttrsDir => "Changing attributes of",
            _ => "Deleting",
        };
        self.status(format!("{} {}", verb, self.job.item.name));
        let dir = self.job.item.path.clone();
        if self.core.conn.cwd.as_deref() == Some(dir.as_str()) {
            self.simple_command();
        } else {
            self.send(Command::Cwd(dir), SubState::SimpleCwd);
        }
    }

    pub(super) fn on_simple_cwd(&mut self, reply: Reply) {
        if reply.is_success() {
            self.core.conn.cwd = Some(self.job.item.path.clone());
            self.simple_command();
        } else {
            self.core.conn.cwd = None;
            self.fail(ProblemCode::UnableToCwd, None, Some(reply.text()));
        }
    }

    fn simple_command(&mut self) {
        let name = self.job.item.name.clone();
        let cmd = match self.job.item.kind {
            ItemType::DeleteDir => Command::Rmd(name),
            ItemType::ChAttrsFile | ItemType::ChAttrsDir => Command::Chmod {
                mode: self.job.item.attrs.unwrap_or(0o644),
                name,
            },
            _ => Command::Dele(name),
        };
        self.send(cmd, SubState::SimpleCommand);
    }

    pub(super) fn on_simple_command(&mut self, reply: Reply) {
        let scope = self.env.scope;
        let (path, name) = (self.job.item.path.clone(), self.job.item.name.clone());
        match self.job.item.kind {
            ItemType::DeleteFile | ItemType::DeleteLink if reply.is_success() => {
                self.env.cache.report_delete(scope, &path, &name);
                self.done();
            }
            ItemType::DeleteDir if reply.is_success() => {
                self.env.cache.report_delete(scope, &path, &name);
                self.env.cache.invalidate_path_listing(scope, &server_join(&path, &name));
                self.done();
            }
            ItemType::ChAttrsFile | ItemType::ChAttrsDir if reply.is_success() => {
                self.env.cache.invalidate_path_listing(scope, &path);
                self.done();
            }
            ItemType::DeleteDir => self.fail(ProblemCode::UnableToDeleteDir, None, Some(reply.text())),
            ItemType::ChAttrsFile | ItemType::ChAttrsDir => {
                self.fail(ProblemCode::UnableToChangeAttrs, None, Some(reply.text()))
            }
            _ => self.fail(ProblemCode::UnableToDeleteFile, None, Some(reply.text())),
        }
    }

    /// List the directory and queue one child item per entry in front of
    /// the directory itself.
    pub(super) fn explore(&mut self) {
        let dir = server_join(&self.job.item.path, &self.job.item.name);
        self.status(format!("Exploring {}", dir));
        let listing = match self.env.cache.get_listing(self.env.scope, &dir, self.core.worker) {
            ListingQuery::Ready(listing) => listing,
            ListingQuery::Fetch => return self.begin_listing(dir, ListingReturn::Explore),
            ListingQuery::Wait => return self.wait_for_listing(&dir, ListingReturn::Explore),
            ListingQuery::NotAccessible => return self.fail(ProblemCode::UnableToCwd, None, Some(dir)),
        };

        let deleting = self.job.item.kind == ItemType::DeleteExploreDir;
        let attrs = self.job.item.attrs;
        let mut children = Vec::with_capacity(listing.len());
        for entry in listing.iter() {
            let kind = match (entry.kind, deleting) {
                (EntryKind::Directory, _) => self.job.item.kind,
                (EntryKind::File, true) => ItemType::DeleteFile,
                (EntryKind::Link, true) => ItemType::DeleteLink,
                (EntryKind::File, false) => ItemType::ChAttrsFile,
                (EntryKind::Link, false) => continue,
            };
            let mut child = NewItem::server(kind, &dir, &entry.name);
            if let Some(mode) = attrs {
                child = child.with_attrs(mode);
            }
            children.push(child);
        }

        let new_kind = if deleting {
            ItemType::DeleteDir
        } else {
            ItemType::ChAttrsDir
        };
        let count = children.len();
        match self.env.queue.expand_explore_item(self.job.item.id, new_kind, children) {
            Ok(_) => {
                log::debug!("{} explored {} ({} children)", self.core.worker, dir, count);
                self.end(Outcome::ItemDone);
            }
            Err(e) => self.fail(ProblemCode::UnableToCwd, None, Some(e.to_string())),
        }
    }
}
