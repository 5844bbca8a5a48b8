//! The read-side engine.
//!
//! Reading is split in two. [`BamReader::read_object`] constructs objects and
//! lets them read their plain fields; pointer fields only record the IDs they
//! need. [`BamReader::resolve`] then hands every object its pointer targets
//! once all of them exist, repeating until nothing more can be completed.
//!
//! Objects are kept in a table keyed by their stream ID. Records whose type
//! cannot be constructed are skipped whole (records are length-framed), and
//! pointers to them resolve to null.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::datagram::DatagramIterator;
use crate::error::{BamError, DanglingReference, Result};
use crate::factory::FactoryParams;
use crate::format::{BamEndian, BamHeader, BamObjectCode, read_type_index};
use crate::id::ObjectId;
use crate::io::{DataSource, DatagramSource, Frame};
use crate::types::{Registry, TypeHandle};
use crate::writable::WritableRef;

/// What to do with a record whose type has no factory, directly or through
/// any ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnknownTypePolicy {
    /// Skip the record, log it, and resolve pointers to it as null.
    #[default]
    Skip,
    /// Fail the read with [`BamError::UnknownType`].
    Abort,
}

/// A record the reader could not construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    /// ID the record defined.
    pub object_id: ObjectId,
    /// Type name as written in the stream.
    pub type_name: String,
    /// Stream offset of the record's length prefix.
    pub offset: u64,
    /// Number of field bytes skipped.
    pub size: usize,
}

/// A type as described by the stream.
#[derive(Debug)]
struct FileType {
    name: String,
    local: Option<TypeHandle>,
    parents: Vec<u16>,
}

#[derive(Debug)]
struct CreatedObj {
    object: Option<WritableRef>,
    type_name: String,
    skipped: bool,
    /// Built as an ancestor of the record's type.
    general: bool,
}

#[derive(Debug, Default)]
struct PointerReference {
    objects: Vec<ObjectId>,
}

enum Outcome {
    Object(ObjectId),
    Pop,
}

/// Reads objects from one BAM stream.
#[derive(Debug)]
pub struct BamReader {
    registry: Arc<Registry>,
    source: DatagramSource,
    header: BamHeader,
    policy: UnknownTypePolicy,
    file_types: HashMap<u16, FileType>,
    created: HashMap<ObjectId, CreatedObj>,
    pending: BTreeMap<ObjectId, PointerReference>,
    int_tags: HashMap<ObjectId, HashMap<String, i32>>,
    finalize_list: BTreeMap<ObjectId, Option<WritableRef>>,
    now_creating: Option<ObjectId>,
    nesting_level: usize,
    skipped: Vec<SkippedRecord>,
}

impl BamReader {
    /// Validates the magic bytes and header of `data`.
    pub fn new(registry: Arc<Registry>, data: DataSource) -> Result<Self> {
        let mut source = DatagramSource::open(data)?;
        let frame = source
            .next_frame()?
            .ok_or_else(|| BamError::Format("BAM stream has no header".into()))?;
        let bytes = source.data();
        let header = BamHeader::from_bytes(&bytes[frame.payload])
            .inspect_err(|err| error!(%err, "rejecting BAM header"))?;
        debug!(
            major = header.major,
            minor = header.minor,
            endian = ?header.endian,
            stdfloat_double = header.stdfloat_double,
            "opened BAM stream"
        );

        Ok(Self {
            registry,
            source,
            header,
            policy: UnknownTypePolicy::default(),
            file_types: HashMap::new(),
            created: HashMap::new(),
            pending: BTreeMap::new(),
            int_tags: HashMap::new(),
            finalize_list: BTreeMap::new(),
            now_creating: None,
            nesting_level: 0,
            skipped: Vec::new(),
        })
    }

    /// Sets the policy for records of unconstructible types.
    pub fn with_unknown_types(mut self, policy: UnknownTypePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The stream header.
    pub fn header(&self) -> &BamHeader {
        &self.header
    }

    /// Major version of the stream.
    pub fn file_major_ver(&self) -> u16 {
        self.header.major
    }

    /// Minor version of the stream. Types use this in `fillin` to read only
    /// the fields the writer's version had.
    pub fn file_minor_ver(&self) -> u16 {
        self.header.minor
    }

    /// Byte order of the records.
    pub fn file_endian(&self) -> BamEndian {
        self.header.endian
    }

    /// Whether `stdfloat` fields are `f64`.
    pub fn file_stdfloat_double(&self) -> bool {
        self.header.stdfloat_double
    }

    /// The registry used to construct objects.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns true once every record has been consumed.
    pub fn is_eof(&self) -> bool {
        self.source.is_exhausted()
    }

    /// Records skipped so far because their type could not be constructed.
    pub fn skipped_records(&self) -> &[SkippedRecord] {
        &self.skipped
    }

    /// Number of objects still waiting for pointers.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The object defined under `id`, if it was constructed and not removed.
    pub fn object(&self, id: ObjectId) -> Option<WritableRef> {
        self.created.get(&id).and_then(|c| c.object.clone())
    }

    /// Reads the next top-level object and everything written with it.
    ///
    /// The returned object may still be waiting for pointers; call
    /// [`resolve`](Self::resolve) before relying on them. Returns `None` at
    /// the end of the stream.
    pub fn read_object(&mut self) -> Result<Option<WritableRef>> {
        loop {
            let start_level = self.nesting_level;
            let Some(first) = self.read_record()? else {
                debug!("reached end of BAM stream");
                return Ok(None);
            };
            while self.nesting_level > start_level {
                if self.read_record()?.is_none() {
                    return Err(BamError::Format(
                        "stream ended inside an object group".into(),
                    ));
                }
            }

            let Outcome::Object(id) = first else {
                continue;
            };
            let created = self.created.get(&id).ok_or_else(|| {
                BamError::Format(format!("object {id} was referenced but never defined"))
            })?;
            match &created.object {
                Some(object) => return Ok(Some(object.clone())),
                None if created.skipped => {
                    debug!(object_id = %id, "top-level object was skipped; reading on");
                }
                None => {
                    return Err(BamError::Internal(format!(
                        "object {id} was never constructed"
                    )));
                }
            }
        }
    }

    /// Reads a pointer field during `fillin`. The target is delivered to
    /// `complete_pointers` in the order the pointers were read.
    pub fn read_pointer(&mut self, scan: &mut DatagramIterator<'_>) -> Result<ObjectId> {
        let id = ObjectId::new(scan.get_u32()?);
        self.request_pointer(id)?;
        Ok(id)
    }

    /// Reads `count` pointer fields.
    pub fn read_pointers(&mut self, scan: &mut DatagramIterator<'_>, count: usize) -> Result<()> {
        for _ in 0..count {
            self.read_pointer(scan)?;
        }
        Ok(())
    }

    /// Reads and discards a pointer field. It is not delivered to
    /// `complete_pointers`.
    pub fn skip_pointer(&mut self, scan: &mut DatagramIterator<'_>) -> Result<ObjectId> {
        Ok(ObjectId::new(scan.get_u32()?))
    }

    /// Asks for the object `id` on behalf of the object being read or
    /// completed.
    ///
    /// Called from `complete_pointers`, this queues another round: the object
    /// gets `complete_pointers` again once the new targets exist. A null ID is
    /// delivered as `None` and never waited on.
    pub fn request_pointer(&mut self, id: ObjectId) -> Result<()> {
        let requester = self.current_object("request_pointer")?;
        self.pending.entry(requester).or_default().objects.push(id);
        Ok(())
    }

    /// Stores a value for the current object to pick up in `complete_pointers`.
    ///
    /// This also guarantees the object gets a `complete_pointers` call.
    pub fn set_int_tag(&mut self, tag: &str, value: i32) -> Result<()> {
        let requester = self.current_object("set_int_tag")?;
        self.int_tags
            .entry(requester)
            .or_default()
            .insert(tag.to_string(), value);
        self.pending.entry(requester).or_default();
        Ok(())
    }

    /// Returns a value stored by the current object's `set_int_tag`.
    pub fn get_int_tag(&self, tag: &str) -> Result<i32> {
        let requester = self.current_object("get_int_tag")?;
        self.int_tags
            .get(&requester)
            .and_then(|tags| tags.get(tag))
            .copied()
            .ok_or_else(|| BamError::Logic(format!("no int tag `{tag}` was set for {requester}")))
    }

    /// Asks for the current object's `finalize` to run once the stream has
    /// fully resolved.
    pub fn register_finalize(&mut self) -> Result<()> {
        let requester = self.current_object("register_finalize")?;
        self.finalize_list.entry(requester).or_default();
        Ok(())
    }

    /// Completes every object whose pointer targets all exist, repeating
    /// until no more progress is possible.
    ///
    /// Returns `Ok(true)` when nothing is left pending (finalizers have then
    /// run) and `Ok(false)` when some targets may still arrive in records not
    /// read yet. At the end of the stream, unresolved requests are an error
    /// listing every missing target.
    pub fn resolve(&mut self) -> Result<bool> {
        if self.resolve_pending()? {
            return Ok(true);
        }
        if !self.is_eof() {
            debug!(pending = self.pending.len(), "objects still waiting for pointers");
            return Ok(false);
        }
        let err = self.unresolved_error();
        error!(%err, "BAM stream could not be resolved");
        Err(err)
    }

    fn current_object(&self, operation: &str) -> Result<ObjectId> {
        self.now_creating.ok_or_else(|| {
            BamError::Logic(format!(
                "{operation} is only valid while an object is being read"
            ))
        })
    }

    fn read_record(&mut self) -> Result<Option<Outcome>> {
        loop {
            let Some(frame) = self.source.next_frame()? else {
                return Ok(None);
            };
            let data = self.source.data();
            let bytes = &data[frame.payload.clone()];
            let mut scan =
                DatagramIterator::new(bytes, self.header.endian, self.header.stdfloat_double);

            let code = scan.get_u8().map_err(|_| {
                BamError::Format(format!("empty record at offset {}", frame.offset))
            })?;
            match BamObjectCode::from_byte(code)? {
                BamObjectCode::Push => self.nesting_level += 1,
                BamObjectCode::Pop => {
                    self.nesting_level = self.nesting_level.checked_sub(1).ok_or_else(|| {
                        BamError::Format(format!("unbalanced pop record at offset {}", frame.offset))
                    })?;
                    return Ok(Some(Outcome::Pop));
                }
                BamObjectCode::Adjunct if self.nesting_level == 0 => {
                    return Err(BamError::Format(format!(
                        "adjunct record outside a group at offset {}",
                        frame.offset
                    )));
                }
                BamObjectCode::Adjunct => {}
                BamObjectCode::Remove => {
                    self.free_object_ids(&mut scan)?;
                    continue;
                }
            }

            let file_type = self.read_handle(&mut scan)?;
            let id = ObjectId::new(scan.get_u32()?);
            if id.is_null() {
                return Err(BamError::Format(format!(
                    "record at offset {} defines the null ID",
                    frame.offset
                )));
            }

            if file_type == 0 {
                if !self.created.contains_key(&id) {
                    return Err(BamError::Format(format!(
                        "back-reference to undefined object {id}"
                    )));
                }
                trace!(object_id = %id, "read back-reference");
            } else {
                self.read_definition(file_type, id, &mut scan, &frame)?;
            }
            return Ok(Some(Outcome::Object(id)));
        }
    }

    /// Reads a type index, learning the type's definition on first sight.
    fn read_handle(&mut self, scan: &mut DatagramIterator<'_>) -> Result<u16> {
        let (index, defined) = read_type_index(scan, |i| self.file_types.contains_key(&i))?;
        for definition in defined {
            let local = self.registry.types().find_type(&definition.name);
            if local.is_none() {
                debug!(
                    type_name = %definition.name,
                    index = definition.index,
                    "stream defines an unfamiliar type"
                );
            }
            self.file_types.insert(
                definition.index,
                FileType {
                    name: definition.name,
                    local,
                    parents: definition.parents,
                },
            );
        }
        Ok(index)
    }

    /// The nearest type with a factory, searching the stream's own
    /// derivation for types this registry has never heard of.
    fn constructible_type(&self, file_type: u16) -> Option<TypeHandle> {
        let types = self.registry.types();
        let factory = self.registry.factory();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([file_type]);
        while let Some(index) = queue.pop_front() {
            if index == 0 || !seen.insert(index) {
                continue;
            }
            let Some(described) = self.file_types.get(&index) else {
                continue;
            };
            if let Some(local) = described.local
                && let Some(found) = factory.find_registered_type(types, local)
            {
                return Some(found);
            }
            queue.extend(described.parents.iter().copied());
        }
        None
    }

    fn read_definition(
        &mut self,
        file_type: u16,
        id: ObjectId,
        scan: &mut DatagramIterator<'_>,
        frame: &Frame,
    ) -> Result<()> {
        let (type_name, local) = match self.file_types.get(&file_type) {
            Some(t) => (t.name.clone(), t.local),
            None => {
                return Err(BamError::Internal(format!(
                    "type index {file_type} was read but not recorded"
                )));
            }
        };

        // IDs are only reused after a Remove record has cleared them.
        if self.created.contains_key(&id) {
            return Err(BamError::Format(format!(
                "object {id} is defined twice (record at offset {})",
                frame.offset
            )));
        }

        let Some(handle) = self.constructible_type(file_type) else {
            return self.skip_record(id, type_name, scan, frame);
        };

        self.created.insert(
            id,
            CreatedObj {
                object: None,
                type_name: type_name.clone(),
                skipped: false,
                general: false,
            },
        );
        let previous = self.now_creating.replace(id);
        let registry = Arc::clone(&self.registry);
        let made = {
            let mut params = FactoryParams {
                scan: &mut *scan,
                reader: &mut *self,
                type_handle: handle,
            };
            registry.factory().make(handle, &mut params)
        };
        self.now_creating = previous;

        let object = match made {
            Ok(object) => object,
            Err(err) => {
                self.created.remove(&id);
                self.pending.remove(&id);
                self.int_tags.remove(&id);
                self.finalize_list.remove(&id);
                return Err(err);
            }
        };

        let built = registry.types().find_type(object.type_name());
        if built != local {
            if local.is_none() {
                debug!(%type_name, built = object.type_name(), "constructed a more general type");
            } else {
                warn!(%type_name, built = object.type_name(), "factory built a different type");
            }
        }
        warn_leftover(scan, &type_name);

        trace!(object_id = %id, type_name = object.type_name(), "read object");
        if let Some(created) = self.created.get_mut(&id) {
            created.object = Some(WritableRef::from_boxed(object));
            created.general = built != local;
        }
        Ok(())
    }

    fn skip_record(
        &mut self,
        id: ObjectId,
        type_name: String,
        scan: &mut DatagramIterator<'_>,
        frame: &Frame,
    ) -> Result<()> {
        if self.policy == UnknownTypePolicy::Abort {
            error!(object_id = %id, %type_name, "no factory for record type");
            return Err(BamError::UnknownType { name: type_name });
        }
        let size = scan.get_remaining_bytes().len();
        warn!(
            object_id = %id,
            %type_name,
            offset = frame.offset,
            size,
            "skipping record of unknown type"
        );
        self.skipped.push(SkippedRecord {
            object_id: id,
            type_name: type_name.clone(),
            offset: frame.offset,
            size,
        });
        self.created.insert(
            id,
            CreatedObj {
                object: None,
                type_name,
                skipped: true,
                general: false,
            },
        );
        Ok(())
    }

    /// Handles a `Remove` record: the writer will never mention these IDs
    /// again.
    fn free_object_ids(&mut self, scan: &mut DatagramIterator<'_>) -> Result<()> {
        // Objects must be complete before they leave the table.
        self.resolve_pending()?;

        while scan.get_remaining_size() > 0 {
            let id = ObjectId::new(scan.get_u32()?);
            let Some(created) = self.created.remove(&id) else {
                warn!(object_id = %id, "stream frees an object that is already gone");
                continue;
            };
            if self.pending.remove(&id).is_some() {
                warn!(object_id = %id, "freeing an object whose pointers never resolved");
            }
            self.int_tags.remove(&id);
            if let Some(held) = self.finalize_list.get_mut(&id) {
                *held = created.object;
            }
            trace!(object_id = %id, "freed object");
        }
        Ok(())
    }

    /// One fixpoint run. Returns true (after finalizing) when nothing is
    /// pending.
    fn resolve_pending(&mut self) -> Result<bool> {
        loop {
            let mut progressed = false;
            // complete_pointers may add requests, so walk a snapshot.
            let requesters: Vec<ObjectId> = self.pending.keys().copied().collect();
            for requester in requesters {
                if self.try_complete(requester)? {
                    progressed = true;
                }
            }
            if self.pending.is_empty() {
                self.finalize()?;
                return Ok(true);
            }
            if !progressed {
                return Ok(false);
            }
        }
    }

    fn try_complete(&mut self, requester: ObjectId) -> Result<bool> {
        let Some(request) = self.pending.get(&requester) else {
            return Ok(false);
        };
        let Some(object) = self.created.get(&requester).and_then(|c| c.object.clone()) else {
            return Ok(false);
        };
        let fully_complete = object.try_borrow()?.require_fully_complete();

        let mut pointers = Vec::with_capacity(request.objects.len());
        for &target in &request.objects {
            if target.is_null() {
                pointers.push(None);
                continue;
            }
            let Some(created) = self.created.get(&target) else {
                return Ok(false);
            };
            if created.skipped {
                warn!(
                    requester = %requester,
                    target = %target,
                    type_name = %created.type_name,
                    "pointer to a skipped record resolves to null"
                );
                pointers.push(None);
                continue;
            }
            let Some(target_object) = &created.object else {
                return Ok(false);
            };
            if created.general {
                warn!(
                    requester = %requester,
                    target = %target,
                    type_name = %created.type_name,
                    built = target_object.type_name(),
                    "pointer to an object built as a more general type resolves to null"
                );
                pointers.push(None);
                continue;
            }
            if fully_complete && target != requester && self.pending.contains_key(&target) {
                return Ok(false);
            }
            pointers.push(Some(target_object.clone()));
        }

        self.pending.remove(&requester);
        let previous = self.now_creating.replace(requester);
        let result = object
            .try_borrow_mut()
            .and_then(|mut o| o.complete_pointers(&pointers, self));
        self.now_creating = previous;
        let consumed = result?;
        if consumed != pointers.len() {
            warn!(
                object_id = %requester,
                type_name = object.type_name(),
                consumed,
                delivered = pointers.len(),
                "complete_pointers consumed a different number of pointers than were read"
            );
        }
        if !self.pending.contains_key(&requester) {
            self.int_tags.remove(&requester);
        }
        trace!(object_id = %requester, pointers = pointers.len(), "completed object");
        Ok(true)
    }

    fn finalize(&mut self) -> Result<()> {
        while let Some((id, held)) = self.finalize_list.pop_first() {
            let Some(object) = held.or_else(|| self.object(id)) else {
                continue;
            };
            trace!(object_id = %id, type_name = object.type_name(), "finalizing");
            let previous = self.now_creating.replace(id);
            let result = object.try_borrow_mut().and_then(|mut o| o.finalize(self));
            self.now_creating = previous;
            result?;
        }
        Ok(())
    }

    fn unresolved_error(&self) -> BamError {
        let mut dangling = Vec::new();
        for (&requester, request) in &self.pending {
            let requester_type = self
                .created
                .get(&requester)
                .map_or_else(|| "<unknown>".to_string(), |c| c.type_name.clone());
            for &target in &request.objects {
                if target.is_null() || self.created.contains_key(&target) {
                    continue;
                }
                let entry = DanglingReference {
                    requester,
                    requester_type: requester_type.clone(),
                    target,
                };
                if !dangling.contains(&entry) {
                    dangling.push(entry);
                }
            }
        }
        if dangling.is_empty() {
            let stuck: Vec<String> = self.pending.keys().map(ObjectId::to_string).collect();
            BamError::Logic(format!(
                "objects {} wait on each other and can never complete",
                stuck.join(", ")
            ))
        } else {
            BamError::DanglingReferences(dangling)
        }
    }
}

fn warn_leftover(scan: &DatagramIterator<'_>, type_name: &str) {
    let remaining = scan.get_remaining_size();
    if remaining > 0 {
        warn!(type_name, remaining, "skipping unread bytes at the end of a record");
    }
}
