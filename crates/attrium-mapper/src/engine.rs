//! The mapping engine: dependency index, change propagation, assignment
//! application.
//!
//! Loading builds the dependency index (the *relations* multimap) from the
//! right-hand sides of all assignments. At run time, a change to an
//! attribute looks up the assignments that read it, groups competing
//! candidates per destination, and applies the winning assignment's value.
//! Priority, clearance-before-regular ordering, and chain-reaction
//! suppression all live here.

use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use attrium_store::{AttributeChange, AttributeId, AttributeStore, AttributeTypeId, ValueState};
use tracing::{debug, error, warn};

use crate::ast::{Assignment, AssignmentKind, AstTree, AttributePath, ScopeSettings, ValueKind};
use crate::error::{MapperError, Result};
use crate::eval::{
    collect_dependencies, find_unknown_function, find_unknown_function_in_element,
    path_dependencies, path_matches_destination, walk_path, Evaluator,
};
use crate::process::PropagationControl;

/// External parser for mapping sources. The expression grammar lives outside
/// the core; anything that can produce an [`AstTree`] plugs in here.
pub trait MapParser {
    fn parse(&self, source: &str) -> std::result::Result<AstTree, String>;
}

/// Derived, cached facts about a loaded assignment, used to group equivalent
/// assignments competing for the same kind of destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentProperties {
    pub priority: i32,
    pub value_kind: ValueKind,
    pub assigned_type: AttributeTypeId,
}

/// Index of an assignment in the engine's table.
pub type AssignmentId = usize;

#[derive(Debug)]
struct LoadedAssignment {
    assignment: Assignment,
    settings: Rc<ScopeSettings>,
    properties: AssignmentProperties,
}

/// Equivalent assignments keyed by priority, ascending. One assignment per
/// priority; the first one registered wins a priority tie.
type EquivalentAssignments = BTreeMap<i32, AssignmentId>;

/// The mapping engine.
pub struct MapperEngine {
    assignments: Vec<LoadedAssignment>,
    relations: BTreeMap<(AttributeTypeId, ValueKind), Vec<AssignmentId>>,
    watched: std::collections::BTreeSet<(AttributeTypeId, ValueState)>,
    common_parent_type: AttributeTypeId,
}

impl MapperEngine {
    /// Create an engine evaluating assignments under common parents of the
    /// given type.
    pub fn new(common_parent_type: AttributeTypeId) -> Self {
        Self {
            assignments: Vec::new(),
            relations: BTreeMap::new(),
            watched: std::collections::BTreeSet::new(),
            common_parent_type,
        }
    }

    /// Change the engine-wide common parent type.
    pub fn set_common_parent_type(&mut self, attribute_type: AttributeTypeId) {
        debug!(
            common_parent_type = attribute_type,
            "mapper engine configured with common parent type"
        );
        self.common_parent_type = attribute_type;
    }

    /// Drop all loaded assignments and relations.
    pub fn reset(&mut self) {
        self.assignments.clear();
        self.relations.clear();
        self.watched.clear();
    }

    /// Number of loaded assignments.
    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// Number of dependency relations.
    pub fn relation_count(&self) -> usize {
        self.relations.values().map(Vec::len).sum()
    }

    /// Whether changes to `(type, state)` are of interest to any loaded
    /// assignment. The runtime uses this in place of per-pair callback
    /// registration.
    pub fn is_watched(&self, attribute_type: AttributeTypeId, state: ValueState) -> bool {
        self.watched.contains(&(attribute_type, state))
    }

    /// Load every `.uam` file in a directory, in lexical order. Fails on the
    /// first bad file.
    pub fn load_path(&mut self, directory: &Path, parser: &dyn MapParser) -> Result<()> {
        if !directory.is_dir() {
            return Err(MapperError::DirectoryNotFound(
                directory.display().to_string(),
            ));
        }
        let mut files: Vec<_> = std::fs::read_dir(directory)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().map(|e| e == "uam").unwrap_or(false))
            .collect();
        files.sort();
        for file in files {
            self.load_file(&file, parser)?;
        }
        Ok(())
    }

    /// Load a single mapping file.
    pub fn load_file(&mut self, file: &Path, parser: &dyn MapParser) -> Result<()> {
        debug!(file = %file.display(), "loading mapping file");
        let source = std::fs::read_to_string(file)?;
        let ast = parser.parse(&source).map_err(|message| MapperError::Parse {
            unit: file.display().to_string(),
            message,
        })?;
        self.load_ast(&ast)
    }

    /// Parse and load a single expression string.
    pub fn add_expression(&mut self, source: &str, parser: &dyn MapParser) -> Result<()> {
        let ast = parser.parse(source).map_err(|message| MapperError::Parse {
            unit: "expression".into(),
            message,
        })?;
        self.load_ast(&ast)
    }

    /// Load a parsed tree into the dependency index.
    ///
    /// The whole tree is validated before anything is committed: a failure
    /// leaves the engine exactly as it was.
    pub fn load_ast(&mut self, ast: &AstTree) -> Result<()> {
        for scope in ast {
            for assignment in &scope.assignments {
                if let Some(name) = find_unknown_function(&assignment.rhs) {
                    return Err(MapperError::UnknownFunction(name.to_string()));
                }
                for element in &assignment.lhs.elements {
                    if let Some(name) = find_unknown_function_in_element(element) {
                        return Err(MapperError::UnknownFunction(name.to_string()));
                    }
                }
            }
        }

        let mut staged = Vec::new();
        for scope in ast {
            let settings = Rc::new(scope.settings.clone());
            for assignment in &scope.assignments {
                let mut dependencies = collect_dependencies(&assignment.rhs);
                if dependencies.is_empty() {
                    return Err(MapperError::ConstantAssignment(assignment.to_string()));
                }

                let elements = &assignment.lhs.elements;
                let last = match elements.last() {
                    Some(last) => last,
                    None => {
                        return Err(MapperError::AmbiguousAssignedType(
                            assignment.lhs.to_string(),
                        ))
                    }
                };
                // A multi-element path also depends on its parent element
                // existing, or the final step is unreachable.
                if elements.len() > 1 {
                    dependencies.extend(path_dependencies(
                        ValueKind::Existence,
                        &elements[elements.len() - 2],
                    ));
                }

                let last_dependencies = path_dependencies(assignment.lhs.kind, last);
                if last_dependencies.len() != 1 {
                    return Err(MapperError::AmbiguousAssignedType(
                        assignment.lhs.to_string(),
                    ));
                }
                let assigned_type = last_dependencies[0].0;

                // Conservative cycle check: a subscript-free assignment must
                // not read the very value it writes. Subscripted paths can
                // legitimately diverge per instance and are left alone.
                if !assignment.lhs.has_subscript()
                    && dependencies.contains(&(assigned_type, assignment.lhs.kind))
                {
                    return Err(MapperError::SelfReferential(assignment.to_string()));
                }

                staged.push((
                    assignment.clone(),
                    Rc::clone(&settings),
                    AssignmentProperties {
                        priority: scope.settings.priority,
                        value_kind: assignment.lhs.kind,
                        assigned_type,
                    },
                    dependencies,
                ));
            }
        }

        for (assignment, settings, properties, dependencies) in staged {
            let id = self.assignments.len();
            self.assignments.push(LoadedAssignment {
                assignment,
                settings,
                properties,
            });
            for dependency in dependencies {
                self.relations.entry(dependency).or_default().push(id);
                self.watched.insert((dependency.0, dependency.1.state()));
            }
        }

        debug!(relations = self.relation_count(), "relation(s) detected");
        Ok(())
    }

    fn scope_parent_type(&self, settings: &ScopeSettings) -> AttributeTypeId {
        settings.common_parent_type.unwrap_or(self.common_parent_type)
    }

    /// All assignments with the same kind, value kind, and assigned type as
    /// the given one, keyed by priority.
    fn equivalent_assignments(&self, id: AssignmentId) -> EquivalentAssignments {
        let initial = &self.assignments[id];
        let mut equivalents = EquivalentAssignments::new();
        for (candidate_id, candidate) in self.assignments.iter().enumerate() {
            if candidate.assignment.kind == initial.assignment.kind
                && candidate.properties.value_kind == initial.properties.value_kind
                && candidate.properties.assigned_type == initial.properties.assigned_type
            {
                equivalents
                    .entry(candidate.properties.priority)
                    .or_insert(candidate_id);
            }
        }
        equivalents
    }

    /// Destination an assignment would write for a change to `origin`,
    /// resolved non-creating. `None` when the common parent or the path
    /// cannot be resolved.
    fn potential_destination(
        &self,
        store: &AttributeStore,
        id: AssignmentId,
        origin: AttributeId,
    ) -> Option<AttributeId> {
        let loaded = &self.assignments[id];
        let parent_type = self.scope_parent_type(&loaded.settings);
        let common_parent = match store.first_parent_of_type(origin, parent_type) {
            Some(parent) if store.node_exists(parent) => parent,
            _ => {
                debug!(
                    origin = %origin,
                    common_parent_type = parent_type,
                    "cannot locate common parent node"
                );
                return None;
            }
        };
        walk_path(store, common_parent, &loaded.assignment.lhs.elements).target()
    }

    /// Resolve (and optionally create) the destination of a path under a
    /// common parent. Only the final element is ever created.
    fn destination_for(
        &self,
        store: &mut AttributeStore,
        common_parent: AttributeId,
        lhs: &AttributePath,
        create_if_missing: bool,
    ) -> Option<AttributeId> {
        let resolution = walk_path(store, common_parent, &lhs.elements);
        if resolution.all_parsed() {
            return resolution.node;
        }
        if resolution.only_last_missing() && create_if_missing {
            let parent = resolution.node?;
            let failed_type = resolution.failed_type?;
            debug!(
                attribute_type = failed_type,
                parent = %parent,
                "creating missing destination attribute"
            );
            return store.add_node(failed_type, parent).ok();
        }
        None
    }

    /// React to an attribute change: re-evaluate every assignment that
    /// depends on the changed `(type, kind)` pair.
    ///
    /// Candidates with a known destination are grouped so a single
    /// evaluation wave runs per destination, clearance assignments first,
    /// then regular ones. Instance assignments and candidates without a
    /// resolvable destination run immediately, individually.
    pub fn on_attribute_changed(
        &self,
        store: &mut AttributeStore,
        control: &mut PropagationControl,
        node: AttributeId,
        state: ValueState,
        change: AttributeChange,
    ) {
        let kind = match change {
            AttributeChange::Created | AttributeChange::Deleted => ValueKind::Existence,
            AttributeChange::Updated => match state {
                ValueState::Reported => ValueKind::Reported,
                ValueState::Desired => ValueKind::Desired,
            },
        };

        if change == AttributeChange::Deleted {
            // A deletion takes the reported value with it; let dependents
            // observe that before the node becomes unreachable.
            self.on_attribute_changed(
                store,
                control,
                node,
                ValueState::Reported,
                AttributeChange::Updated,
            );
        }

        let Some(node_type) = store.node_type(node) else {
            return;
        };
        let Some(candidates) = self.relations.get(&(node_type, kind)) else {
            return;
        };

        // Group candidates per destination so each unique destination gets
        // one evaluation wave. The map also folds together candidates whose
        // equivalence sets coincide.
        let mut to_run: BTreeMap<(AttributeId, ValueKind, AssignmentKind), EquivalentAssignments> =
            BTreeMap::new();
        for &candidate in candidates {
            let destination = self.potential_destination(store, candidate, node);
            let loaded = &self.assignments[candidate];
            let equivalents = self.equivalent_assignments(candidate);

            match destination {
                Some(destination) if loaded.assignment.kind != AssignmentKind::Instance => {
                    to_run.insert(
                        (destination, loaded.properties.value_kind, loaded.assignment.kind),
                        equivalents,
                    );
                }
                _ => self.run_assignments(store, control, &equivalents, destination, node),
            }
        }

        // Clearances first, so a value cleared this wave cannot survive a
        // regular write from the same wave.
        for (key, equivalents) in &to_run {
            if key.2 == AssignmentKind::Clearance {
                self.run_assignments(store, control, equivalents, Some(key.0), node);
            }
        }
        for (key, equivalents) in &to_run {
            if key.2 == AssignmentKind::Regular {
                self.run_assignments(store, control, equivalents, Some(key.0), node);
            }
        }
    }

    /// Run a set of equivalent assignments against one destination.
    ///
    /// With a known destination, candidates run highest-priority first and
    /// the wave stops at the first one applied. With an unknown destination,
    /// or for instance assignments, all candidates run in ascending priority
    /// so the highest-priority effect lands last and wins.
    fn run_assignments(
        &self,
        store: &mut AttributeStore,
        control: &mut PropagationControl,
        candidates: &EquivalentAssignments,
        destination: Option<AttributeId>,
        origin: AttributeId,
    ) {
        let Some(first) = candidates.values().next() else {
            return;
        };
        let run_all = destination.is_none()
            || self.assignments[*first].assignment.kind == AssignmentKind::Instance;

        if run_all {
            debug!(
                candidates = candidates.len(),
                origin = %origin,
                "running all equivalent assignments in ascending priority"
            );
            for &candidate in candidates.values() {
                self.run_assignment(store, control, candidate, destination, origin);
            }
        } else {
            for (&priority, &candidate) in candidates.iter().rev() {
                if self.run_assignment(store, control, candidate, destination, origin) {
                    debug!(priority, "assignment executed successfully");
                    return;
                }
            }
            debug!(origin = %origin, "no assignment yielded a value");
        }
    }

    /// Run a single assignment. Returns whether it was applied.
    fn run_assignment(
        &self,
        store: &mut AttributeStore,
        control: &mut PropagationControl,
        id: AssignmentId,
        destination: Option<AttributeId>,
        origin: AttributeId,
    ) -> bool {
        let loaded = &self.assignments[id];
        let settings = &loaded.settings;
        let parent_type = self.scope_parent_type(settings);

        // A known destination must structurally match this assignment's LHS.
        if let Some(destination) = destination {
            if !path_matches_destination(
                store,
                destination,
                &loaded.assignment.lhs.elements,
                parent_type,
            ) {
                return false;
            }
        }

        let anchor = destination.unwrap_or(origin);
        let common_parent = match store.first_parent_of_type(anchor, parent_type) {
            None => {
                debug!(
                    origin = %origin,
                    common_parent_type = parent_type,
                    "unable to locate the common parent node, check the common parent type; \
                     skipping assignment"
                );
                return false;
            }
            // Marked for deletion: skip quietly, the subtree is going away.
            Some(parent) if !store.node_exists(parent) => return false,
            Some(parent) => parent,
        };

        let Some(value) = Evaluator::new(store, common_parent).evaluate(&loaded.assignment.rhs)
        else {
            return false;
        };

        let suppressed_here = !settings.chain_reaction
            && destination
                .map(|d| !control.reactions_paused(d))
                .unwrap_or(false);
        let mark = store.pending_event_count();
        if let Some(destination) = destination {
            if suppressed_here {
                control.pause_reactions(destination);
            }
        }

        let applied = match loaded.assignment.kind {
            AssignmentKind::Instance => self.apply_instance_assignment(
                store,
                control,
                common_parent,
                value,
                id,
                settings.chain_reaction,
            ),
            AssignmentKind::Clearance => {
                self.apply_clearance_assignment(store, common_parent, value, id)
            }
            AssignmentKind::Regular => self.apply_regular_assignment(
                store,
                control,
                common_parent,
                origin,
                value,
                id,
            ),
        };

        if let Some(destination) = destination {
            if suppressed_here {
                store.discard_events_since(mark, Some(destination));
                control.resume_reactions(destination);
            }
        }

        applied
    }

    fn apply_regular_assignment(
        &self,
        store: &mut AttributeStore,
        control: &mut PropagationControl,
        common_parent: AttributeId,
        origin: AttributeId,
        value: f64,
        id: AssignmentId,
    ) -> bool {
        let loaded = &self.assignments[id];
        let settings = &loaded.settings;
        let lhs = &loaded.assignment.lhs;

        let create_if_missing = should_create_attributes(lhs.kind, settings, value);
        let Some(destination) =
            self.destination_for(store, common_parent, lhs, create_if_missing)
        else {
            return false;
        };

        // The destination may differ from the one the wave was grouped on
        // (it may just have been created); open a suppression window for it
        // as well when chain reactions are off.
        let suppressed_here =
            !settings.chain_reaction && !control.reactions_paused(destination);
        let mark = store.pending_event_count();
        if suppressed_here {
            control.pause_reactions(destination);
        }

        debug!(
            expression = %loaded.assignment,
            origin = %origin,
            destination = %destination,
            value,
            "applying assignment"
        );

        match lhs.kind {
            ValueKind::Reported => {
                if settings.clear_desired {
                    let _ = store.undefine_desired(destination);
                }
                if let Err(err) = store.set_reported_number(destination, value) {
                    error!(destination = %destination, %err, "failed to set reported value");
                }
            }
            ValueKind::Desired => {
                if let Err(err) = store.set_desired_number(destination, value) {
                    error!(destination = %destination, %err, "failed to set desired value");
                }
            }
            ValueKind::Existence => {
                // Existence assignments create/delete rather than set values.
                // Creation on nonzero happened through create_if_missing.
                if value == 0.0 {
                    debug!(destination = %destination, "deleting attribute");
                    if let Err(err) = store.delete_node(destination) {
                        error!(destination = %destination, %err, "failed to delete attribute");
                    }
                }
            }
        }

        if suppressed_here {
            store.discard_events_since(mark, Some(destination));
            control.resume_reactions(destination);
        }
        true
    }

    fn apply_instance_assignment(
        &self,
        store: &mut AttributeStore,
        control: &mut PropagationControl,
        common_parent: AttributeId,
        value: f64,
        id: AssignmentId,
        chain_reaction: bool,
    ) -> bool {
        let loaded = &self.assignments[id];
        let lhs = &loaded.assignment.lhs;
        let Some(last) = lhs.elements.last() else {
            return false;
        };

        // Resolve the path prefix, non-creating.
        let mut parent = common_parent;
        if lhs.elements.len() > 1 {
            let prefix = &lhs.elements[..lhs.elements.len() - 1];
            match walk_path(store, common_parent, prefix).target() {
                Some(node) => parent = node,
                None => {
                    debug!(expression = %loaded.assignment, "instance path prefix not resolvable");
                    return false;
                }
            }
        }

        // With a trailing subscript the evaluated value is an existence
        // boolean and the subscript carries the instance value; without one,
        // the evaluated value is the instance value itself.
        let (target_type, target_value, should_exist) = match last {
            crate::ast::PathElement::Subscript { attr_type, index } => {
                let evaluator = Evaluator::new(store, parent);
                let (Some(instance_type), Some(instance_value)) =
                    (evaluator.evaluate(attr_type), evaluator.evaluate(index))
                else {
                    warn!(
                        expression = %loaded.assignment,
                        "cannot derive value/type of instance subscript, check the mapping files"
                    );
                    return false;
                };
                (
                    instance_type as AttributeTypeId,
                    instance_value,
                    value != 0.0,
                )
            }
            crate::ast::PathElement::Type(_) => {
                (loaded.properties.assigned_type, value, true)
            }
        };

        let value_state = match lhs.kind {
            ValueKind::Reported => ValueState::Reported,
            ValueKind::Desired => ValueState::Desired,
            ValueKind::Existence => {
                error!("invalid map: instance assignments require r' or d'");
                return false;
            }
        };

        let existing = store
            .children_of_type(parent, target_type)
            .into_iter()
            .find(|child| store.get_number_in_state(*child, value_state) == Some(target_value));

        debug!(
            parent = %parent,
            attribute_type = target_type,
            instance_value = target_value,
            should_exist,
            "instance check"
        );

        if !should_exist {
            if let Some(node) = existing {
                debug!(node = %node, "instance should not exist, deleting");
                let _ = store.delete_node(node);
            }
            return true;
        }

        if existing.is_some() {
            return true;
        }

        // Create the missing instance. The creation and the initial write
        // must not recurse into instance resolution, so mapping is paused
        // around them unless chain reactions are wanted.
        let mark = store.pending_event_count();
        if !chain_reaction {
            control.pause_mapping();
        }
        let result = match store.add_node(target_type, parent) {
            Ok(node) => {
                let write = match value_state {
                    ValueState::Reported => store.set_reported_number(node, target_value),
                    ValueState::Desired => store.set_desired_number(node, target_value),
                };
                if let Err(err) = write {
                    error!(node = %node, %err, "failed to write instance value");
                }
                true
            }
            Err(err) => {
                error!(parent = %parent, %err, "failed to create instance attribute");
                false
            }
        };
        if !chain_reaction {
            store.discard_events_since(mark, None);
            control.resume_mapping();
        }
        result
    }

    fn apply_clearance_assignment(
        &self,
        store: &mut AttributeStore,
        common_parent: AttributeId,
        value: f64,
        id: AssignmentId,
    ) -> bool {
        let loaded = &self.assignments[id];
        let lhs = &loaded.assignment.lhs;

        let Some(destination) = self.destination_for(store, common_parent, lhs, false) else {
            debug!(expression = %loaded.assignment, "destination not found, map not applied");
            return false;
        };

        if value == 0.0 {
            debug!(destination = %destination, "value will not be cleared");
            return true;
        }

        match lhs.kind {
            ValueKind::Reported => {
                let _ = store.undefine_reported(destination);
                debug!(destination = %destination, "reported value cleared");
            }
            ValueKind::Desired => {
                let _ = store.undefine_desired(destination);
                debug!(destination = %destination, "desired value cleared");
            }
            ValueKind::Existence => {
                error!("invalid map: clearance assignments require r' or d'");
                return false;
            }
        }
        true
    }
}

/// Whether a regular assignment should create its destination when missing:
/// existence assignments create on a truthy value, and a scope can opt in
/// for everything else.
fn should_create_attributes(kind: ValueKind, settings: &ScopeSettings, value: f64) -> bool {
    (kind == ValueKind::Existence && value != 0.0) || settings.create_attributes
}
