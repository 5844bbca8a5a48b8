//! The write-side engine.
//!
//! [`BamWriter::write_object`] writes one top-level object together with
//! everything reachable from it that the stream has not seen yet. Objects are
//! visited breadth first: writing an object's fields queues the targets of
//! its pointers, and the queue is drained before `write_object` returns.
//!
//! Each object is written once per stream. The writer remembers written
//! objects by address through weak handles, so it never keeps them alive;
//! objects that have since been dropped are reported to the reader with a
//! `Remove` record.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::datagram::Datagram;
use crate::error::{BamError, Result};
use crate::format::{BamEndian, BamHeader, BamObjectCode};
use crate::id::ObjectId;
use crate::io::DatagramSink;
use crate::types::{Registry, TypeHandle};
use crate::writable::{WeakWritableRef, WritableRef};

#[derive(Debug)]
struct StoreState {
    id: ObjectId,
    written: bool,
    object: WeakWritableRef,
}

/// Writes objects to one BAM stream.
#[derive(Debug)]
pub struct BamWriter<'w> {
    registry: Arc<Registry>,
    sink: DatagramSink<'w>,
    header: BamHeader,
    needs_init: bool,
    poisoned: bool,
    next_object_id: ObjectId,
    state: HashMap<usize, StoreState>,
    queue: VecDeque<WritableRef>,
    types_written: HashSet<u32>,
    freed_ids: Vec<ObjectId>,
    next_code: BamObjectCode,
}

impl<'w> BamWriter<'w> {
    /// Creates a writer for the current format version.
    pub fn new(registry: Arc<Registry>, sink: DatagramSink<'w>) -> Self {
        Self::with_header(registry, sink, BamHeader::default())
    }

    /// Creates a writer producing the given header's version and encoding.
    ///
    /// Nothing is written until the first object (or [`finish`](Self::finish)).
    pub fn with_header(registry: Arc<Registry>, sink: DatagramSink<'w>, header: BamHeader) -> Self {
        Self {
            registry,
            sink,
            header,
            needs_init: true,
            poisoned: false,
            next_object_id: ObjectId::new(1),
            state: HashMap::new(),
            queue: VecDeque::new(),
            types_written: HashSet::new(),
            freed_ids: Vec::new(),
            next_code: BamObjectCode::Push,
        }
    }

    /// Major version being written.
    pub fn file_major_ver(&self) -> u16 {
        self.header.major
    }

    /// Minor version being written. Types use this to omit fields the target
    /// version does not have.
    pub fn file_minor_ver(&self) -> u16 {
        self.header.minor
    }

    /// Byte order of the records.
    pub fn file_endian(&self) -> BamEndian {
        self.header.endian
    }

    /// Whether `stdfloat` fields are written as `f64`.
    pub fn file_stdfloat_double(&self) -> bool {
        self.header.stdfloat_double
    }

    /// The registry this writer resolves type names against.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns true if `object` has been written (or queued) in this stream.
    pub fn has_object(&self, object: &WritableRef) -> bool {
        self.live_state(object).is_some()
    }

    /// Writes `object` and every not yet written object reachable from it.
    ///
    /// Writing an object a second time emits only a short back-reference
    /// record, so the reader's `read_object` calls stay in step.
    pub fn write_object(&mut self, object: &WritableRef) -> Result<()> {
        self.check_poisoned()?;
        let result = self.write_object_inner(object);
        if result.is_err() {
            self.poisoned = true;
            self.queue.clear();
        }
        result
    }

    fn write_object_inner(&mut self, object: &WritableRef) -> Result<()> {
        self.init()?;
        self.sweep_freed();
        if !self.freed_ids.is_empty() {
            let mut dg = self.new_datagram();
            dg.add_u8(BamObjectCode::Remove.as_u8());
            for id in self.freed_ids.drain(..) {
                dg.add_u32(id.as_u32());
            }
            self.sink.put_datagram(&dg)?;
        }

        self.next_code = BamObjectCode::Push;
        let id = self.enqueue(object)?;
        debug!(object_id = %id, type_name = object.type_name(), "writing object");
        self.flush_queue()?;

        if self.next_code != BamObjectCode::Push {
            let mut dg = self.new_datagram();
            dg.add_u8(BamObjectCode::Pop.as_u8());
            self.sink.put_datagram(&dg)?;
        }
        Ok(())
    }

    /// Writes a pointer field and returns the ID written.
    ///
    /// `None` is written as the null ID. A target the stream has not seen is
    /// queued and will be written before the current `write_object` returns.
    pub fn write_pointer(
        &mut self,
        dg: &mut Datagram,
        target: Option<&WritableRef>,
    ) -> Result<ObjectId> {
        let id = match target {
            None => ObjectId::NULL,
            Some(object) => match self.live_state(object).map(|state| state.id) {
                Some(id) => id,
                None => self.enqueue(object)?,
            },
        };
        dg.add_u32(id.as_u32());
        Ok(id)
    }

    /// Flushes buffered output.
    pub fn flush(&mut self) -> Result<()> {
        self.check_poisoned()?;
        self.sink.flush().inspect_err(|_| self.poisoned = true)
    }

    /// Writes the header if nothing else has been written, then flushes.
    pub fn finish(mut self) -> Result<()> {
        self.check_poisoned()?;
        self.init()?;
        self.sink.flush()?;
        debug!(
            objects = self.next_object_id.as_u32() - 1,
            bytes = self.sink.current_offset(),
            "finished BAM stream"
        );
        Ok(())
    }

    /// Number of bytes emitted so far.
    pub fn bytes_written(&self) -> u64 {
        self.sink.current_offset()
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(BamError::Logic(
                "writer is unusable after an earlier failure".into(),
            ));
        }
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        if !self.needs_init {
            return Ok(());
        }
        self.sink.write_magic()?;
        self.sink.put_datagram(&self.header.to_datagram())?;
        self.needs_init = false;
        debug!(
            major = self.header.major,
            minor = self.header.minor,
            endian = ?self.header.endian,
            "wrote BAM header"
        );
        Ok(())
    }

    fn new_datagram(&self) -> Datagram {
        Datagram::new(self.header.endian, self.header.stdfloat_double)
    }

    fn live_state(&self, object: &WritableRef) -> Option<&StoreState> {
        self.state
            .get(&object.addr())
            .filter(|state| !state.object.is_dead())
    }

    /// Forgets objects that were dropped since they were written.
    fn sweep_freed(&mut self) {
        let freed = &mut self.freed_ids;
        self.state.retain(|_, state| {
            if state.object.is_dead() {
                freed.push(state.id);
                false
            } else {
                true
            }
        });
        if !freed.is_empty() {
            freed.sort();
            debug!(count = freed.len(), "announcing freed objects");
        }
    }

    fn enqueue(&mut self, object: &WritableRef) -> Result<ObjectId> {
        let id = match self.live_state(object).map(|state| state.id) {
            Some(id) => id,
            None => {
                let id = self.next_object_id;
                self.next_object_id = id
                    .next()
                    .ok_or_else(|| BamError::Logic("object ID space exhausted".into()))?;
                self.state.insert(
                    object.addr(),
                    StoreState {
                        id,
                        written: false,
                        object: object.downgrade(),
                    },
                );
                id
            }
        };
        self.queue.push_back(object.clone());
        Ok(id)
    }

    fn flush_queue(&mut self) -> Result<()> {
        while let Some(object) = self.queue.pop_front() {
            let (id, written) = match self.state.get(&object.addr()) {
                Some(state) => (state.id, state.written),
                None => {
                    return Err(BamError::Internal(format!(
                        "queued {} has no object ID",
                        object.type_name()
                    )));
                }
            };

            let mut dg = self.new_datagram();
            dg.add_u8(self.next_code.as_u8());
            self.next_code = BamObjectCode::Adjunct;

            if written {
                self.write_handle(&mut dg, TypeHandle::NONE)?;
                dg.add_u32(id.as_u32());
                trace!(object_id = %id, "wrote back-reference");
            } else {
                let handle = self.writable_type(&object)?;
                self.write_handle(&mut dg, handle)?;
                dg.add_u32(id.as_u32());
                object.try_borrow()?.write_datagram(self, &mut dg)?;
                if let Some(state) = self.state.get_mut(&object.addr()) {
                    state.written = true;
                }
                trace!(object_id = %id, type_name = object.type_name(), size = dg.len(), "wrote object");
            }
            self.sink.put_datagram(&dg)?;
        }
        Ok(())
    }

    /// The type to record for `object`: its own, or the nearest ancestor a
    /// reader can construct.
    fn writable_type(&self, object: &WritableRef) -> Result<TypeHandle> {
        let name = object.type_name();
        let types = self.registry.types();
        let handle = types.find_type(name).ok_or_else(|| {
            BamError::Logic(format!("type {name} is not registered with this writer"))
        })?;
        match self.registry.factory().find_registered_type(types, handle) {
            Some(registered) if registered != handle => {
                info!(
                    written_as = types.name(registered).unwrap_or("<unnamed>"),
                    type_name = name,
                    "writing nearest readable type instead"
                );
                Ok(registered)
            }
            Some(registered) => Ok(registered),
            None => {
                warn!(type_name = name, "type has no read factory; readers will skip it");
                Ok(handle)
            }
        }
    }

    /// Writes a type index, followed on its first occurrence by the type's
    /// name and, recursively, its parents.
    fn write_handle(&mut self, dg: &mut Datagram, handle: TypeHandle) -> Result<()> {
        let index = u16::try_from(handle.index()).map_err(|_| {
            BamError::Logic(format!("type index {} does not fit the format", handle.index()))
        })?;
        dg.add_u16(index);
        if handle.is_none() || !self.types_written.insert(handle.index()) {
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        let name = registry
            .type_name_for_version(handle, self.header.major, self.header.minor)
            .ok_or_else(|| BamError::Internal(format!("{handle:?} has no name")))?;
        dg.add_string(name)?;

        let parents = registry.types().parents(handle);
        let count = u8::try_from(parents.len()).map_err(|_| {
            BamError::Logic(format!("type {name} has more than 255 parents"))
        })?;
        dg.add_u8(count);
        for &parent in parents {
            self.write_handle(dg, parent)?;
        }
        Ok(())
    }
}
