/// Identifies one source text registered with the driving front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u32);

/// A byte range in a source text.
///
/// Spans are attached to IR nodes at construction time and propagated
/// verbatim through every later stage; the debug-information serializer is
/// their only consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    pub source: SourceId,
    pub offset: u32,
    pub len: u32,
}

impl SourceSpan {
    pub fn new(source: SourceId, offset: u32, len: u32) -> Self {
        Self {
            source,
            offset,
            len,
        }
    }
}
