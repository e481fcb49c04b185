//! Wire messages
//!
//! Protobuf v3 message definitions for everything that crosses a process or
//! storage boundary: topic envelopes, batch/metadata notifications, and the
//! persisted tick state itself. The structs are prost-derived and match the
//! canonical `.proto` layout field for field, so blobs written here stay
//! readable by any protobuf toolchain.

mod envelope;

pub use envelope::{DecodedPayload, EnvelopeError, unwrap_envelope, wrap_payload};

/// Wrapper around every topic payload.
///
/// `payload` is a packed `Any`; readers resolve the concrete type through the
/// type-URL decoder registry in [`envelope`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicEnvelope {
    /// Unique per topic; assigned by the writer.
    #[prost(string, tag = "1")]
    pub message_id: ::prost::alloc::string::String,
    /// Writer-assigned wall clock, epoch milliseconds.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "3")]
    pub payload: ::core::option::Option<::prost_types::Any>,
}

/// Notification that a batch blob has been persisted to storage.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchInfo {
    #[prost(string, tag = "1")]
    pub simulation_run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub storage_key: ::prost::alloc::string::String,
    /// Inclusive.
    #[prost(int64, tag = "3")]
    pub tick_start: i64,
    /// Inclusive.
    #[prost(int64, tag = "4")]
    pub tick_end: i64,
    #[prost(int64, tag = "5")]
    pub written_at_ms: i64,
}

/// Notification that `{runId}/metadata.pb` has been persisted.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetadataInfo {
    #[prost(string, tag = "1")]
    pub simulation_run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub storage_key: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub written_at_ms: i64,
}

/// Static description of a simulation run, written once per run.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimulationMetadata {
    #[prost(string, tag = "1")]
    pub simulation_run_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub environment: ::core::option::Option<EnvironmentSpec>,
    #[prost(int64, tag = "3")]
    pub start_time_ms: i64,
    #[prost(int64, tag = "4")]
    pub initial_seed: i64,
}

/// World geometry: dimension count, per-axis extent, per-axis wrap flags.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvironmentSpec {
    #[prost(int32, tag = "1")]
    pub dimensions: i32,
    #[prost(int64, repeated, tag = "2")]
    pub shape: ::prost::alloc::vec::Vec<i64>,
    #[prost(bool, repeated, tag = "3")]
    pub toroidal: ::prost::alloc::vec::Vec<bool>,
}

/// A contiguous inclusive range of ticks, persisted as one storage blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TickDataBatch {
    #[prost(message, repeated, tag = "1")]
    pub ticks: ::prost::alloc::vec::Vec<TickData>,
}

/// Full state of one simulation tick.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TickData {
    #[prost(int64, tag = "1")]
    pub tick_number: i64,
    #[prost(message, repeated, tag = "2")]
    pub organisms: ::prost::alloc::vec::Vec<OrganismState>,
    #[prost(message, optional, tag = "3")]
    pub environment_state: ::core::option::Option<EnvironmentState>,
}

/// Opaque per-tick environment payload; the indexer stores it as a codec-
/// wrapped blob without interpreting the cell data.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvironmentState {
    #[prost(bytes = "vec", tag = "1")]
    pub cells: ::prost::alloc::vec::Vec<u8>,
}

/// An n-dimensional integer coordinate or direction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Vector {
    #[prost(int64, repeated, tag = "1")]
    pub coords: ::prost::alloc::vec::Vec<i64>,
}

/// A machine operand: either a scalar or a vector.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Operand {
    #[prost(oneof = "operand::Value", tags = "1, 2")]
    pub value: ::core::option::Option<operand::Value>,
}

/// Nested message and enum types in `Operand`.
pub mod operand {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "1")]
        Scalar(i64),
        #[prost(message, tag = "2")]
        Vector(super::Vector),
    }
}

/// One frame of an organism's procedure call stack.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallFrame {
    #[prost(message, optional, tag = "1")]
    pub return_ip: ::core::option::Option<Vector>,
    #[prost(message, repeated, tag = "2")]
    pub saved_procedure_registers: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "3")]
    pub saved_formal_param_registers: ::prost::alloc::vec::Vec<Operand>,
}

/// Complete state of one organism in one tick.
///
/// The static fields (`parent_id`, `birth_tick`, `program_id`,
/// `initial_position`) ride along in every tick on the wire but are only
/// persisted once, into the `organisms` table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrganismState {
    #[prost(int64, tag = "1")]
    pub organism_id: i64,
    #[prost(int64, optional, tag = "2")]
    pub parent_id: ::core::option::Option<i64>,
    #[prost(int64, tag = "3")]
    pub birth_tick: i64,
    #[prost(string, tag = "4")]
    pub program_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "5")]
    pub initial_position: ::core::option::Option<Vector>,
    #[prost(int64, tag = "6")]
    pub energy: i64,
    #[prost(message, optional, tag = "7")]
    pub ip: ::core::option::Option<Vector>,
    #[prost(message, optional, tag = "8")]
    pub dv: ::core::option::Option<Vector>,
    #[prost(message, repeated, tag = "9")]
    pub data_pointers: ::prost::alloc::vec::Vec<Vector>,
    #[prost(int32, tag = "10")]
    pub active_dp_index: i32,
    #[prost(message, repeated, tag = "11")]
    pub data_registers: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "12")]
    pub procedure_registers: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "13")]
    pub formal_param_registers: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "14")]
    pub location_registers: ::prost::alloc::vec::Vec<Vector>,
    #[prost(message, repeated, tag = "15")]
    pub data_stack: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "16")]
    pub location_stack: ::prost::alloc::vec::Vec<Vector>,
    #[prost(message, repeated, tag = "17")]
    pub call_stack: ::prost::alloc::vec::Vec<CallFrame>,
    #[prost(bool, tag = "18")]
    pub instruction_failed: bool,
    #[prost(string, tag = "19")]
    pub failure_reason: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "20")]
    pub failure_call_stack: ::prost::alloc::vec::Vec<CallFrame>,
}

/// The non-grid-critical remainder of an organism's runtime state, packed
/// into the `runtime_state_blob` column of `organism_states`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrganismRuntimeState {
    #[prost(message, repeated, tag = "1")]
    pub data_registers: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "2")]
    pub procedure_registers: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "3")]
    pub formal_param_registers: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "4")]
    pub location_registers: ::prost::alloc::vec::Vec<Vector>,
    #[prost(message, repeated, tag = "5")]
    pub data_stack: ::prost::alloc::vec::Vec<Operand>,
    #[prost(message, repeated, tag = "6")]
    pub location_stack: ::prost::alloc::vec::Vec<Vector>,
    #[prost(message, repeated, tag = "7")]
    pub call_stack: ::prost::alloc::vec::Vec<CallFrame>,
    #[prost(bool, tag = "8")]
    pub instruction_failed: bool,
    #[prost(string, tag = "9")]
    pub failure_reason: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "10")]
    pub failure_call_stack: ::prost::alloc::vec::Vec<CallFrame>,
}

impl OrganismState {
    /// Split off the runtime remainder that goes into `runtime_state_blob`.
    pub fn runtime_state(&self) -> OrganismRuntimeState {
        OrganismRuntimeState {
            data_registers: self.data_registers.clone(),
            procedure_registers: self.procedure_registers.clone(),
            formal_param_registers: self.formal_param_registers.clone(),
            location_registers: self.location_registers.clone(),
            data_stack: self.data_stack.clone(),
            location_stack: self.location_stack.clone(),
            call_stack: self.call_stack.clone(),
            instruction_failed: self.instruction_failed,
            failure_reason: self.failure_reason.clone(),
            failure_call_stack: self.failure_call_stack.clone(),
        }
    }
}

/// Pack a vector into the fixed-width little-endian byte form used by the
/// `ip`, `dv`, `data_pointers` and `initial_position` columns.
pub fn pack_vector(v: &Vector) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.coords.len() * 8);
    for c in &v.coords {
        out.extend_from_slice(&c.to_le_bytes());
    }
    out
}

/// Pack a sequence of vectors, length-prefixed per element.
pub fn pack_vectors(vs: &[Vector]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in vs {
        out.extend_from_slice(&(v.coords.len() as u32).to_le_bytes());
        out.extend_from_slice(&pack_vector(v));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_batch_info_roundtrip() {
        let info = BatchInfo {
            simulation_run_id: "2025101412000000-a".into(),
            storage_key: "2025101412000000-a/batch_0000000000_0000000099.pb".into(),
            tick_start: 0,
            tick_end: 99,
            written_at_ms: 1_760_000_000_000,
        };
        let bytes = info.encode_to_vec();
        let decoded = BatchInfo::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_organism_runtime_state_split() {
        let organism = OrganismState {
            organism_id: 7,
            birth_tick: 10,
            program_id: "seed.s".into(),
            energy: 500,
            data_stack: vec![Operand {
                value: Some(operand::Value::Scalar(42)),
            }],
            instruction_failed: true,
            failure_reason: "TURN on non-unit vector".into(),
            ..Default::default()
        };
        let runtime = organism.runtime_state();
        assert!(runtime.instruction_failed);
        assert_eq!(runtime.failure_reason, "TURN on non-unit vector");
        assert_eq!(runtime.data_stack.len(), 1);
    }

    #[test]
    fn test_pack_vector_layout() {
        let v = Vector { coords: vec![1, -2] };
        let packed = pack_vector(&v);
        assert_eq!(packed.len(), 16);
        assert_eq!(&packed[..8], &1i64.to_le_bytes());
        assert_eq!(&packed[8..], &(-2i64).to_le_bytes());
    }

    #[test]
    fn test_pack_vectors_prefixes_length() {
        let vs = vec![Vector { coords: vec![3] }, Vector { coords: vec![1, 2] }];
        let packed = pack_vectors(&vs);
        assert_eq!(&packed[..4], &1u32.to_le_bytes());
        assert_eq!(packed.len(), 4 + 8 + 4 + 16);
    }
}
