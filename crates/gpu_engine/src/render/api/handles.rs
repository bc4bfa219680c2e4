//! Typed resource handles
//!
//! Each resource kind gets an uninhabited tag type so handles of different
//! kinds cannot be mixed up.

use crate::foundation::Handle;

macro_rules! resource_tags {
    ($($(#[$doc:meta])* $tag:ident => $alias:ident, $variant:ident;)*) => {
        $(
            $(#[$doc])*
            #[derive(Debug)]
            pub enum $tag {}

            #[doc = concat!("Handle to a pooled [`", stringify!($tag), "`] resource")]
            pub type $alias = Handle<$tag>;

            impl ResourceTag for $tag {
                const KIND: &'static str = stringify!($variant);

                fn released(handle: Handle<Self>) -> ReleasedHandle {
                    ReleasedHandle::$variant(handle)
                }
            }
        )*

        /// A handle whose owning `Holder` was dropped and that awaits destruction
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum ReleasedHandle {
            $(
                #[allow(missing_docs)]
                $variant($alias),
            )*
        }
    };
}

/// Resource kinds that can be released through a `Holder`
pub trait ResourceTag: Sized {
    /// Kind name used in log messages
    const KIND: &'static str;

    /// Wrap a handle of this kind for the release queue
    fn released(handle: Handle<Self>) -> ReleasedHandle;
}

resource_tags! {
    /// Buffer tag
    BufferTag => BufferHandle, Buffer;
    /// Texture tag
    TextureTag => TextureHandle, Texture;
    /// Sampler tag
    SamplerTag => SamplerHandle, Sampler;
    /// Shader module tag
    ShaderModuleTag => ShaderModuleHandle, ShaderModule;
    /// Compute pipeline tag
    ComputePipelineTag => ComputePipelineHandle, ComputePipeline;
    /// Render pipeline tag
    RenderPipelineTag => RenderPipelineHandle, RenderPipeline;
    /// Query pool tag
    QueryPoolTag => QueryPoolHandle, QueryPool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_handle_wraps_kind() {
        let handle = TextureHandle::new(3, 2);
        assert_eq!(TextureTag::released(handle), ReleasedHandle::Texture(handle));
        assert_eq!(BufferTag::KIND, "Buffer");
        assert_eq!(QueryPoolTag::KIND, "QueryPool");
    }
}
