// vellum-common: shared types and the OT engine for the Vellum workspace

pub mod ot;
pub mod ranges;
pub mod update;
