//! Uniform traversal over resolved configuration trees

use crate::layout::{
    Entry, EntryHeader, EventEntry, GroupEntry, GroupRep, IntegerEntry, Root, SegmentEntry,
    StringEntry,
};

/// Tree visitor. The default implementations descend into containers in
/// declared order (replicas in ascending index) and funnel every variable
/// through [`Visit::visit_leaf`]; override the per-variant methods to
/// special-case entry kinds.
pub trait Visit {
    fn visit_root(&mut self, root: &Root) {
        self.visit_children(&root.entries);
    }

    fn visit_entry(&mut self, entry: &Entry) {
        match entry {
            Entry::Segment(e) => self.visit_segment(e),
            Entry::Group(e) => self.visit_group(e),
            Entry::GroupRep(e) => self.visit_group_rep(e),
            Entry::Int(e) => self.visit_int(e),
            Entry::Event(e) => self.visit_event(e),
            Entry::Str(e) => self.visit_string(e),
        }
    }

    fn visit_leaf(&mut self, _header: &EntryHeader) {}

    fn visit_int(&mut self, entry: &IntegerEntry) {
        self.visit_leaf(&entry.header);
    }

    fn visit_event(&mut self, entry: &EventEntry) {
        self.visit_leaf(&entry.header);
    }

    fn visit_string(&mut self, entry: &StringEntry) {
        self.visit_leaf(&entry.header);
    }

    fn visit_segment(&mut self, entry: &SegmentEntry) {
        self.visit_children(&entry.entries);
    }

    fn visit_group(&mut self, entry: &GroupEntry) {
        self.visit_children(&entry.entries);
    }

    fn visit_group_rep(&mut self, entry: &GroupRep) {
        self.visit_children(&entry.entries);
    }

    fn visit_children(&mut self, entries: &[Entry]) {
        for entry in entries {
            self.visit_entry(entry);
        }
    }
}
