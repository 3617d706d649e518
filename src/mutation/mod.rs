use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::value::{FieldValue, ObjectValue};

/// The set of field paths a Patch mutation (or a squashed overlay) writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMask {
    paths: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(paths: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            paths: BTreeSet::new(),
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.paths.iter()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.paths.iter().any(|mask_path| mask_path.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        FieldMask {
            paths: self.paths.union(&other.paths).cloned().collect(),
        }
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.paths.insert(path);
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Server-computed value applied to one field when the mutation commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FieldValue>),
    ArrayRemove(Vec<FieldValue>),
    NumericIncrement(FieldValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Local (latency-compensated) application of the transform.
    fn apply_local(&self, previous: Option<&FieldValue>, write_time: Timestamp) -> FieldValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FieldValue::Timestamp(write_time),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                numeric_increment(previous, operand)
            }
        }
    }
}

fn array_union(existing: Option<&FieldValue>, additions: &[FieldValue]) -> FieldValue {
    let mut values = match existing {
        Some(FieldValue::Array(values)) => values.clone(),
        _ => Vec::new(),
    };
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FieldValue::Array(values)
}

fn array_remove(existing: Option<&FieldValue>, removals: &[FieldValue]) -> FieldValue {
    let values = match existing {
        Some(FieldValue::Array(values)) => values.clone(),
        _ => Vec::new(),
    };
    FieldValue::Array(
        values
            .into_iter()
            .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
            .collect(),
    )
}

fn numeric_increment(existing: Option<&FieldValue>, operand: &FieldValue) -> FieldValue {
    match (existing, operand) {
        (Some(FieldValue::Integer(current)), FieldValue::Integer(delta)) => {
            match current.checked_add(*delta) {
                Some(sum) => FieldValue::Integer(sum),
                // Overflow promotes to double, matching server behavior.
                None => FieldValue::Double(*current as f64 + *delta as f64),
            }
        }
        (Some(FieldValue::Integer(current)), FieldValue::Double(delta)) => {
            FieldValue::Double(*current as f64 + delta)
        }
        (Some(FieldValue::Double(current)), FieldValue::Integer(delta)) => {
            FieldValue::Double(current + *delta as f64)
        }
        (Some(FieldValue::Double(current)), FieldValue::Double(delta)) => {
            FieldValue::Double(current + delta)
        }
        // Non-numeric or missing base: the operand becomes the value.
        (_, operand) => operand.clone(),
    }
}

/// Gate a mutation applies only when the precondition holds against the
/// current document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_valid_for(&self, doc: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => doc.is_found_document() == *exists,
            Precondition::UpdateTime(version) => {
                doc.is_found_document() && doc.version() == *version
            }
        }
    }
}

/// A single write. Set replaces, Patch merges through a mask, Delete removes,
/// Verify asserts a precondition without writing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Patch {
        key: DocumentKey,
        value: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, value: ObjectValue, mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            value,
            mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn with_transforms(self, transforms: Vec<FieldTransform>) -> Self {
        match self {
            Mutation::Set {
                key,
                value,
                precondition,
                ..
            } => Mutation::Set {
                key,
                value,
                precondition,
                field_transforms: transforms,
            },
            Mutation::Patch {
                key,
                value,
                mask,
                precondition,
                ..
            } => Mutation::Patch {
                key,
                value,
                mask,
                precondition,
                field_transforms: transforms,
            },
            other => other,
        }
    }

    pub fn with_precondition(self, precondition: Precondition) -> Self {
        match self {
            Mutation::Set {
                key,
                value,
                field_transforms,
                ..
            } => Mutation::Set {
                key,
                value,
                precondition,
                field_transforms,
            },
            Mutation::Patch {
                key,
                value,
                mask,
                field_transforms,
                ..
            } => Mutation::Patch {
                key,
                value,
                mask,
                precondition,
                field_transforms,
            },
            Mutation::Delete { key, .. } => Mutation::Delete { key, precondition },
            Mutation::Verify { key, .. } => Mutation::Verify { key, precondition },
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// The mask of fields this mutation writes, or `None` when it replaces
    /// the whole document (Set and Delete).
    pub fn field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch {
                mask,
                field_transforms,
                ..
            } => {
                let mut mask = mask.clone();
                for transform in field_transforms {
                    mask.insert(transform.field().clone());
                }
                Some(mask)
            }
            Mutation::Set { .. } | Mutation::Delete { .. } => None,
            Mutation::Verify { .. } => Some(FieldMask::empty()),
        }
    }

    /// Applies the mutation to the local view of `doc` for latency
    /// compensation.
    ///
    /// `previous_mask` is the accumulated mask of fields already mutated by
    /// earlier batches for this document; the return value is the updated
    /// mask (or `None` once the whole document is authored locally), which
    /// the overlay cache persists alongside the squashed overlay mutation.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(doc) {
            return previous_mask;
        }

        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let mut data = value.clone();
                apply_local_transforms(&mut data, field_transforms, local_write_time);
                doc.convert_to_found_document(SnapshotVersion::MIN, data);
                doc.set_has_local_mutations();
                None
            }
            Mutation::Patch {
                value,
                mask,
                field_transforms,
                ..
            } => {
                let mut data = doc.data().clone();
                for path in mask.paths() {
                    match value.field(path) {
                        Some(field_value) => data.set(path, field_value.clone()),
                        None => data.delete(path),
                    }
                }
                apply_local_transforms(&mut data, field_transforms, local_write_time);
                doc.convert_to_found_document(SnapshotVersion::MIN, data);
                doc.set_has_local_mutations();
                previous_mask.map(|previous| {
                    let mut merged = previous;
                    for path in mask.paths() {
                        merged.insert(path.clone());
                    }
                    for transform in field_transforms {
                        merged.insert(transform.field().clone());
                    }
                    merged
                })
            }
            Mutation::Delete { .. } => {
                doc.convert_to_no_document(SnapshotVersion::MIN);
                doc.set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies an acknowledged mutation to the remote document cache entry.
    /// Unlike the local view this never fails: the server already committed.
    pub fn apply_to_remote_document(&self, doc: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let mut data = value.clone();
                apply_server_transforms(&mut data, field_transforms, &result.transform_results);
                doc.convert_to_found_document(result.version, data);
                doc.set_has_committed_mutations();
            }
            Mutation::Patch {
                value,
                mask,
                field_transforms,
                ..
            } => {
                if !doc.is_found_document() {
                    // Patch against unknown contents: existence is certain,
                    // the data is not.
                    doc.convert_to_unknown_document(result.version);
                    return;
                }
                let mut data = doc.data().clone();
                for path in mask.paths() {
                    match value.field(path) {
                        Some(field_value) => data.set(path, field_value.clone()),
                        None => data.delete(path),
                    }
                }
                apply_server_transforms(&mut data, field_transforms, &result.transform_results);
                doc.convert_to_found_document(result.version, data);
                doc.set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                doc.convert_to_no_document(result.version);
                doc.set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Extracts the pre-mutation values of transformed fields so replays of
    /// this batch stay idempotent (numeric increments in particular).
    pub fn extract_base_value(&self, doc: &MutableDocument) -> Option<Mutation> {
        let mut base = ObjectValue::empty();
        let mut mask = FieldMask::empty();
        for transform in self.field_transforms() {
            if let TransformOperation::NumericIncrement(_) = transform.operation() {
                let existing = doc.data().field(transform.field());
                let coerced = match existing {
                    Some(value @ (FieldValue::Integer(_) | FieldValue::Double(_))) => {
                        value.clone()
                    }
                    _ => FieldValue::Integer(0),
                };
                base.set(transform.field(), coerced);
                mask.insert(transform.field().clone());
            }
        }
        if mask.is_empty() {
            None
        } else {
            Some(Mutation::Patch {
                key: self.key().clone(),
                value: base,
                mask,
                precondition: Precondition::None,
                field_transforms: Vec::new(),
            })
        }
    }
}

fn apply_local_transforms(
    data: &mut ObjectValue,
    transforms: &[FieldTransform],
    write_time: Timestamp,
) {
    for transform in transforms {
        let previous = data.field(transform.field()).cloned();
        let value = transform.apply_local(previous.as_ref(), write_time);
        data.set(transform.field(), value);
    }
}

fn apply_server_transforms(
    data: &mut ObjectValue,
    transforms: &[FieldTransform],
    transform_results: &[FieldValue],
) {
    for (index, transform) in transforms.iter().enumerate() {
        if let Some(result) = transform_results.get(index) {
            data.set(transform.field(), result.clone());
        }
    }
}

/// Per-mutation outcome inside an acknowledged batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FieldValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }
}

/// A batch acknowledgement from the backend, pairing each mutation with its
/// commit outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: bytes::Bytes,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: bytes::Bytes,
    ) -> Self {
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
        }
    }

    /// Versions mutated documents should be stored at: the per-mutation
    /// version when present, else the batch commit version.
    pub fn doc_versions(&self) -> BTreeMap<DocumentKey, SnapshotVersion> {
        self.batch
            .mutations
            .iter()
            .zip(self.mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect()
    }
}

/// An ordered group of mutations committed and acknowledged atomically.
///
/// `base_mutations` record pre-image values for transform idempotence; they
/// apply only to the local view and are never sent to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies every mutation in this batch affecting `doc`, threading the
    /// overlay field mask through.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.base_mutations {
            if mutation.key() == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        for mutation in &self.mutations {
            if mutation.key() == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the batch to a set of documents, returning the overlay masks
    /// produced for each key.
    pub fn apply_to_local_document_set(
        &self,
        docs: &mut BTreeMap<DocumentKey, MutableDocument>,
        masks: &mut BTreeMap<DocumentKey, Option<FieldMask>>,
    ) {
        for key in self.keys() {
            if let Some(doc) = docs.get_mut(&key) {
                let previous = masks
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                let updated = self.apply_to_local_view(doc, previous);
                masks.insert(key, updated);
            }
        }
    }
}

/// The squashed net effect of all pending batches on one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: i32,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// Computes the single mutation whose application reproduces the local view
/// of `doc`, given the mask accumulated while replaying the pending batches.
///
/// `mask == None` means the document was fully authored locally (Set or
/// Delete); otherwise a Patch restricted to the mutated fields suffices.
pub fn calculate_overlay_mutation(
    doc: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    match mask {
        None => {
            if doc.is_no_document() {
                Some(Mutation::delete(doc.key().clone()))
            } else if doc.is_found_document() {
                Some(Mutation::set(doc.key().clone(), doc.data().clone()))
            } else {
                None
            }
        }
        Some(mask) => {
            if mask.is_empty() {
                return None;
            }
            let mut value = ObjectValue::empty();
            let mut trimmed = FieldMask::empty();
            for path in mask.paths() {
                match doc.data().field(path) {
                    Some(field_value) => value.set(path, field_value.clone()),
                    None => {}
                }
                trimmed.insert(path.clone());
            }
            Some(Mutation::Patch {
                key: doc.key().clone(),
                value,
                mask: trimmed,
                precondition: Precondition::None,
                field_transforms: Vec::new(),
            })
        }
    }
}
