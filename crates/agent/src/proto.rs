//! Generated protobuf / gRPC bindings.
//!
//! `agent.v1` is the service this agent serves; `platform.v1` and
//! `runtime.v1` are services it consumes.

pub mod agent {
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/agent.v1.rs"));
    }
}

pub mod platform {
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/platform.v1.rs"));
    }
}

pub mod runtime {
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/runtime.v1.rs"));
    }
}
