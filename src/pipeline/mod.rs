//! Pipeline stages for image-to-Markdown transcription.
//!
//! Each submodule implements one step; [`crate::transcribe`] strings them
//! together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ plan ──▶ execute ──▶ refine ──▶ assemble
//!                      │                       │
//!           encode ◀── llm ──▶ parse      postprocess
//! ```
//!
//! 1. [`input`]: validate paths and build one descriptor per page image
//! 2. [`plan`]: pack descriptors into batches under count and payload ceilings
//! 3. [`execute`]: run batches sequentially or on a bounded worker pool, then
//!    merge pages back into order
//! 4. [`llm`]: per batch, [`encode`] the images, call the provider with
//!    retry/backoff, [`parse`] the reply into pages
//! 5. [`refine`]: optional text-only cleanup pass over all pages
//! 6. [`assemble`]: group pages into documents; page bodies go through
//!    [`postprocess`]

pub mod assemble;
pub mod encode;
pub mod execute;
pub mod input;
pub mod llm;
pub mod parse;
pub mod plan;
pub mod postprocess;
pub mod refine;
