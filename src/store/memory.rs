//! In-Memory Graph Store
//!
//! A process-local store used by the CLI and the tests. Attribute instances are
//! unique per (type, value); transactions stage their writes and merge them
//! into the committed graph on commit.

use crate::query::{InsertQuery, MatchInsertQuery, ThingPattern, Value, ValueType, Var};
use crate::schema::{ConceptKind, Schema};
use crate::store::{GraphStore, Session, StoreError, StoreResult, WriteTransaction};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Serialize)]
pub struct Thing {
    pub id: u64,
    pub label: String,
    pub kind: ConceptKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// (role, player id)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub role_players: Vec<(String, u64)>,
}

/// Committed (or staged) graph data
#[derive(Debug, Clone, Default, Serialize)]
pub struct Graph {
    things: BTreeMap<u64, Thing>,
    /// (owner, attribute)
    ownerships: BTreeSet<(u64, u64)>,
    #[serde(skip)]
    attribute_index: HashMap<(String, String), u64>,
    #[serde(skip)]
    owners: HashMap<u64, Vec<u64>>,
}

impl Graph {
    fn add_thing(&mut self, thing: Thing) {
        if let (ConceptKind::Attribute, Some(value)) = (thing.kind, &thing.value) {
            self.attribute_index
                .insert((thing.label.clone(), value.key()), thing.id);
        }
        self.things.insert(thing.id, thing);
    }

    fn add_ownership(&mut self, owner: u64, attribute: u64) {
        if self.ownerships.insert((owner, attribute)) {
            self.owners.entry(attribute).or_default().push(owner);
        }
    }

    pub fn things(&self) -> impl Iterator<Item = &Thing> {
        self.things.values()
    }

    pub fn thing(&self, id: u64) -> Option<&Thing> {
        self.things.get(&id)
    }

    pub fn ownership_count(&self) -> usize {
        self.ownerships.len()
    }

    /// Values of `attribute` owned by `owner`
    pub fn owned_values(&self, owner: u64, attribute: &str) -> Vec<&Value> {
        self.ownerships
            .range((owner, 0)..=(owner, u64::MAX))
            .filter_map(|(_, attr)| self.things.get(attr))
            .filter(|t| t.label == attribute)
            .filter_map(|t| t.value.as_ref())
            .collect()
    }

    pub fn count_by_label(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for thing in self.things.values() {
            *counts.entry(thing.label.clone()).or_insert(0) += 1;
        }
        counts
    }
}

type Binding = HashMap<Var, u64>;

/// Committed graph plus the writes staged by one transaction
struct View<'a> {
    schema: &'a Schema,
    base: &'a Graph,
    staged: &'a Graph,
}

impl<'a> View<'a> {
    fn thing(&self, id: u64) -> Option<&'a Thing> {
        self.staged.things.get(&id).or_else(|| self.base.things.get(&id))
    }

    fn all_things(&self) -> impl Iterator<Item = &'a Thing> {
        self.base.things.values().chain(self.staged.things.values())
    }

    /// Attribute instances of `label` (or a subtype) holding `value`
    fn attribute_ids(&self, label: &str, value: &Value) -> Vec<u64> {
        let key = value.key();
        self.schema
            .labels()
            .filter(|l| self.schema.is_subtype(l, label))
            .flat_map(|l| {
                let index_key = (l.to_string(), key.clone());
                [self.base, self.staged]
                    .into_iter()
                    .filter_map(move |g| g.attribute_index.get(&index_key).copied())
            })
            .collect()
    }

    fn owns(&self, owner: u64, attribute: u64) -> bool {
        self.base.ownerships.contains(&(owner, attribute))
            || self.staged.ownerships.contains(&(owner, attribute))
    }

    fn owners_of(&self, attribute: u64) -> Vec<u64> {
        let mut out: Vec<u64> = [self.base, self.staged]
            .iter()
            .filter_map(|g| g.owners.get(&attribute))
            .flatten()
            .copied()
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    fn candidates(&self, pattern: &ThingPattern, binding: &Binding) -> Vec<u64> {
        if let Some(id) = binding.get(&pattern.var) {
            return vec![*id];
        }
        if let (Some(label), Some(value)) = (&pattern.type_label, &pattern.value) {
            return self.attribute_ids(label, value);
        }
        if let Some(first) = pattern.has.first() {
            let mut owners: Vec<u64> = self
                .attribute_ids(&first.attribute, &first.value)
                .into_iter()
                .flat_map(|attr| self.owners_of(attr))
                .collect();
            owners.sort_unstable();
            owners.dedup();
            return owners;
        }
        self.all_things()
            .filter(|t| match &pattern.type_label {
                Some(label) => self.schema.is_subtype(&t.label, label),
                None => true,
            })
            .map(|t| t.id)
            .collect()
    }

    /// Bindings under which `thing` satisfies `pattern`
    fn extend(&self, pattern: &ThingPattern, thing: &Thing, binding: &Binding) -> Vec<Binding> {
        if let Some(label) = &pattern.type_label {
            if !self.schema.is_subtype(&thing.label, label) {
                return Vec::new();
            }
        }
        if pattern.value.is_some() && pattern.value != thing.value {
            return Vec::new();
        }
        let owns_all = pattern.has.iter().all(|has| {
            self.attribute_ids(&has.attribute, &has.value)
                .into_iter()
                .any(|attr| self.owns(thing.id, attr))
        });
        if !owns_all {
            return Vec::new();
        }

        let mut seed = binding.clone();
        seed.insert(pattern.var.clone(), thing.id);
        let mut out = Vec::new();
        let mut used = vec![false; thing.role_players.len()];
        assign_players(pattern, thing, 0, &mut used, seed, &mut out);
        out
    }

    fn answers(&self, patterns: &[ThingPattern], limit: usize) -> Vec<Binding> {
        let mut out = Vec::new();
        if limit > 0 {
            self.solve(patterns, Binding::new(), limit, &mut out);
        }
        out
    }

    fn solve(&self, patterns: &[ThingPattern], binding: Binding, limit: usize, out: &mut Vec<Binding>) {
        let Some((pattern, rest)) = patterns.split_first() else {
            out.push(binding);
            return;
        };
        for id in self.candidates(pattern, &binding) {
            let Some(thing) = self.thing(id) else { continue };
            for extended in self.extend(pattern, thing, &binding) {
                self.solve(rest, extended, limit, out);
                if out.len() >= limit {
                    return;
                }
            }
        }
    }
}

/// Match the pattern's role players against the relation's, each entry used once
fn assign_players(
    pattern: &ThingPattern,
    thing: &Thing,
    index: usize,
    used: &mut [bool],
    binding: Binding,
    out: &mut Vec<Binding>,
) {
    let Some(wanted) = pattern.role_players.get(index) else {
        out.push(binding);
        return;
    };
    let bound = binding.get(&wanted.player).copied();
    for (pos, (role, player)) in thing.role_players.iter().enumerate() {
        if used[pos] || *role != wanted.role || bound.is_some_and(|b| b != *player) {
            continue;
        }
        used[pos] = true;
        let mut next = binding.clone();
        next.insert(wanted.player.clone(), *player);
        assign_players(pattern, thing, index + 1, used, next, out);
        used[pos] = false;
    }
}

struct Database {
    schema: RwLock<Schema>,
    graph: RwLock<Graph>,
    next_id: AtomicU64,
    commits: AtomicU64,
}

impl Database {
    fn new() -> Self {
        Self {
            schema: RwLock::new(Schema::new()),
            graph: RwLock::new(Graph::default()),
            next_id: AtomicU64::new(1),
            commits: AtomicU64::new(0),
        }
    }

    fn schema(&self) -> StoreResult<RwLockReadGuard<'_, Schema>> {
        self.schema.read().map_err(|_| poisoned())
    }

    fn graph(&self) -> StoreResult<RwLockReadGuard<'_, Graph>> {
        self.graph.read().map_err(|_| poisoned())
    }

    fn graph_mut(&self) -> StoreResult<RwLockWriteGuard<'_, Graph>> {
        self.graph.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> StoreError {
    StoreError::Internal("lock poisoned".to_string())
}

/// Process-local graph store with named databases
#[derive(Default)]
pub struct MemoryStore {
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn database(&self, name: &str) -> StoreResult<Arc<Database>> {
        self.databases
            .read()
            .map_err(|_| poisoned())?
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Rejected(format!("database '{}' does not exist", name)))
    }

    /// Number of committed write transactions
    pub fn commit_count(&self, database: &str) -> StoreResult<u64> {
        Ok(self.database(database)?.commits.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self, database: &str) -> StoreResult<Graph> {
        Ok(self.database(database)?.graph()?.clone())
    }

    pub fn schema(&self, database: &str) -> StoreResult<Schema> {
        Ok(self.database(database)?.schema()?.clone())
    }

    /// Committed instances of `label` and its subtypes
    pub fn count_instances(&self, database: &str, label: &str) -> StoreResult<usize> {
        let db = self.database(database)?;
        let schema = db.schema()?;
        let graph = db.graph()?;
        Ok(graph
            .things()
            .filter(|t| schema.is_subtype(&t.label, label))
            .count())
    }

    /// Answers of a read-only match against the committed graph
    pub fn count_answers(&self, database: &str, patterns: &[ThingPattern]) -> StoreResult<usize> {
        let db = self.database(database)?;
        let schema = db.schema()?;
        let graph = db.graph()?;
        let empty = Graph::default();
        let view = View {
            schema: &schema,
            base: &graph,
            staged: &empty,
        };
        Ok(view.answers(patterns, usize::MAX).len())
    }
}

impl GraphStore for MemoryStore {
    fn database_exists(&self, database: &str) -> StoreResult<bool> {
        Ok(self.databases.read().map_err(|_| poisoned())?.contains_key(database))
    }

    fn create_database(&self, database: &str) -> StoreResult<()> {
        let mut dbs = self.databases.write().map_err(|_| poisoned())?;
        if dbs.contains_key(database) {
            return Err(StoreError::Rejected(format!("database '{}' already exists", database)));
        }
        dbs.insert(database.to_string(), Arc::new(Database::new()));
        Ok(())
    }

    fn delete_database(&self, database: &str) -> StoreResult<()> {
        self.databases
            .write()
            .map_err(|_| poisoned())?
            .remove(database)
            .map(|_| ())
            .ok_or_else(|| StoreError::Rejected(format!("database '{}' does not exist", database)))
    }

    fn define_schema(&self, database: &str, schema: &str) -> StoreResult<()> {
        let db = self.database(database)?;
        let mut current = db.schema.write().map_err(|_| poisoned())?;
        let mut updated = current.clone();
        updated
            .define(schema)
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        *current = updated;
        Ok(())
    }

    fn attribute_value_type(&self, database: &str, label: &str) -> StoreResult<Option<ValueType>> {
        let db = self.database(database)?;
        let schema = db.schema()?;
        if schema.kind(label) != Some(ConceptKind::Attribute) {
            return Ok(None);
        }
        Ok(schema.value_type(label))
    }

    fn session(&self, database: &str) -> StoreResult<Arc<dyn Session>> {
        Ok(Arc::new(MemorySession {
            db: self.database(database)?,
        }))
    }
}

struct MemorySession {
    db: Arc<Database>,
}

impl Session for MemorySession {
    fn write_transaction(&self) -> StoreResult<Box<dyn WriteTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            db: &self.db,
            staged: Graph::default(),
        }))
    }
}

struct MemoryTransaction<'a> {
    db: &'a Database,
    staged: Graph,
}

impl MemoryTransaction<'_> {
    fn run_insert(&mut self, patterns: &[ThingPattern], answers: Vec<Binding>) -> StoreResult<usize> {
        let schema = self.db.schema()?;
        let base = self.db.graph()?;
        let count = answers.len();
        for mut binding in answers {
            for pattern in patterns {
                insert_pattern(&schema, &base, &mut self.staged, &self.db.next_id, pattern, &mut binding)?;
            }
        }
        Ok(count)
    }

    fn match_answers(&self, patterns: &[ThingPattern], limit: usize) -> StoreResult<Vec<Binding>> {
        let schema = self.db.schema()?;
        let base = self.db.graph()?;
        let view = View {
            schema: &schema,
            base: &base,
            staged: &self.staged,
        };
        Ok(view.answers(patterns, limit))
    }
}

impl WriteTransaction for MemoryTransaction<'_> {
    fn insert(&mut self, query: &InsertQuery) -> StoreResult<usize> {
        self.run_insert(&query.insert, vec![Binding::new()])
    }

    fn match_insert(&mut self, query: &MatchInsertQuery) -> StoreResult<usize> {
        let answers = self.match_answers(&query.matches, usize::MAX)?;
        self.run_insert(&query.insert, answers)
    }

    fn count_matches(&mut self, patterns: &[ThingPattern], limit: usize) -> StoreResult<usize> {
        Ok(self.match_answers(patterns, limit)?.len())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction { db, staged } = *self;
        let mut graph = db.graph_mut()?;

        // attributes written concurrently by another transaction collapse into one
        let mut remap: HashMap<u64, u64> = HashMap::new();
        for thing in staged.things.values() {
            if let (ConceptKind::Attribute, Some(value)) = (thing.kind, &thing.value) {
                if let Some(existing) = graph.attribute_index.get(&(thing.label.clone(), value.key())) {
                    remap.insert(thing.id, *existing);
                }
            }
        }
        let resolve = |id: u64| remap.get(&id).copied().unwrap_or(id);

        for mut thing in staged.things.into_values() {
            if remap.contains_key(&thing.id) {
                continue;
            }
            for (_, player) in thing.role_players.iter_mut() {
                *player = resolve(*player);
            }
            graph.add_thing(thing);
        }
        for (owner, attribute) in staged.ownerships {
            graph.add_ownership(resolve(owner), resolve(attribute));
        }
        db.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn rejected(message: String) -> StoreError {
    StoreError::Rejected(message)
}

fn check_value_type(schema: &Schema, label: &str, value: &Value) -> StoreResult<()> {
    match schema.value_type(label) {
        Some(expected) if expected == value.value_type() => Ok(()),
        Some(expected) => Err(rejected(format!(
            "attribute '{}' holds {} values, got {}",
            label,
            expected,
            value.value_type()
        ))),
        None => Err(rejected(format!("attribute type '{}' has no value type", label))),
    }
}

fn attribute_instance(
    schema: &Schema,
    base: &Graph,
    staged: &mut Graph,
    next_id: &AtomicU64,
    label: &str,
    value: &Value,
) -> StoreResult<u64> {
    if schema.kind(label) != Some(ConceptKind::Attribute) {
        return Err(rejected(format!("'{}' is not an attribute type", label)));
    }
    check_value_type(schema, label, value)?;
    let key = (label.to_string(), value.key());
    if let Some(id) = base.attribute_index.get(&key).or_else(|| staged.attribute_index.get(&key)) {
        return Ok(*id);
    }
    let id = next_id.fetch_add(1, Ordering::SeqCst);
    staged.add_thing(Thing {
        id,
        label: label.to_string(),
        kind: ConceptKind::Attribute,
        value: Some(value.clone()),
        role_players: Vec::new(),
    });
    Ok(id)
}

fn insert_pattern(
    schema: &Schema,
    base: &Graph,
    staged: &mut Graph,
    next_id: &AtomicU64,
    pattern: &ThingPattern,
    binding: &mut Binding,
) -> StoreResult<()> {
    let target = match (&pattern.type_label, binding.get(&pattern.var).copied()) {
        (None, Some(id)) => id,
        (None, None) => return Err(rejected(format!("variable {} is not bound", pattern.var))),
        (Some(_), Some(_)) => {
            return Err(rejected(format!("variable {} is already bound", pattern.var)))
        }
        (Some(label), None) => {
            let kind = schema
                .kind(label)
                .ok_or_else(|| rejected(format!("type '{}' is not defined", label)))?;
            if schema.get(label).is_some_and(|d| d.is_abstract) {
                return Err(rejected(format!("type '{}' is abstract", label)));
            }
            let id = match kind {
                ConceptKind::Attribute => {
                    let value = pattern
                        .value
                        .as_ref()
                        .ok_or_else(|| rejected(format!("attribute {} needs a value", pattern.var)))?;
                    attribute_instance(schema, base, staged, next_id, label, value)?
                }
                ConceptKind::Entity | ConceptKind::Relation => {
                    let mut role_players = Vec::with_capacity(pattern.role_players.len());
                    for rp in &pattern.role_players {
                        if !schema.relates(label, &rp.role) {
                            return Err(rejected(format!("'{}' does not relate role '{}'", label, rp.role)));
                        }
                        let player = binding
                            .get(&rp.player)
                            .copied()
                            .ok_or_else(|| rejected(format!("role player {} is not bound", rp.player)))?;
                        role_players.push((rp.role.clone(), player));
                    }
                    if kind == ConceptKind::Relation && role_players.is_empty() {
                        return Err(rejected(format!("relation {} has no role players", pattern.var)));
                    }
                    if kind == ConceptKind::Entity && !role_players.is_empty() {
                        return Err(rejected(format!("entity {} cannot have role players", pattern.var)));
                    }
                    let id = next_id.fetch_add(1, Ordering::SeqCst);
                    staged.add_thing(Thing {
                        id,
                        label: label.clone(),
                        kind,
                        value: None,
                        role_players,
                    });
                    id
                }
            };
            binding.insert(pattern.var.clone(), id);
            id
        }
    };

    let owner_label = staged
        .thing(target)
        .or_else(|| base.thing(target))
        .map(|t| t.label.clone())
        .ok_or_else(|| rejected(format!("{} refers to a missing concept", pattern.var)))?;
    for has in &pattern.has {
        if !schema.owns(&owner_label, &has.attribute) {
            return Err(rejected(format!(
                "'{}' does not own '{}'",
                owner_label, has.attribute
            )));
        }
        let attribute = attribute_instance(schema, base, staged, next_id, &has.attribute, &has.value)?;
        staged.add_ownership(target, attribute);
    }
    Ok(())
}
