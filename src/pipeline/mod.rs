//! Building blocks of the two-stage conversion.
//!
//! Each submodule implements one step; the providers in
//! [`crate::isolation`] compose them.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ stage 1 ──▶ pages ──▶ reassemble ──▶ finalize
//! (doc)    (isolated)  (validate)  (stage 2)     (move into place)
//! ```
//!
//! 1. [`input`]: open the document, prepare the dev-mode preamble
//! 2. [`pages`]: page rasters and the pixel-directory layout; every
//!    page is bounds-checked before stage 2 may read it
//! 3. [`reassemble`]: the stage-2 contract and the host-side runner
//! 4. [`finalize`]: check stage 2 left exactly one PDF and move it to the
//!    caller's output path

pub mod finalize;
pub mod input;
pub mod pages;
pub mod reassemble;
