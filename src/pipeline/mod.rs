//! Pipeline stages and the collaborators they call.
//!
//! Each submodule implements one step. The three network-facing ones expose
//! a trait ([`storage::StorageClient`], [`extract::TextExtractor`],
//! [`infer::FieldInference`]) so the handler can be driven by in-memory
//! substitutes in tests.
//!
//! ## Data Flow
//!
//! ```text
//! storage ──▶ encode ──▶ extract ──▶ infer ──▶ parse ──▶ storage
//! (row+file)  (base64)   (OCR)       (LLM)     (JSON)    (insert)
//! ```
//!
//! 1. [`storage`] — load the document row and download its file
//! 2. [`encode`]  — base64 the bytes for the extraction request body
//! 3. [`extract`] — Cloud Vision or Document AI text detection
//! 4. [`infer`]   — ask the model for the financial fields
//! 5. [`parse`]   — recover and normalise the JSON answer
//!
//! [`auth`] supplies bearer tokens to the Document AI backend.

pub mod auth;
pub mod encode;
pub mod extract;
pub mod infer;
pub mod parse;
pub mod storage;
