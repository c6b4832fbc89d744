pub mod document_chunk;
