//! The ~20 vendor dialects from spec.md §4.8, as a dispatchable enum plus
//! the `FormatSpec` table that drives the generic engine for formats that
//! don't need a bespoke extractor. See SPEC_FULL.md §7 for the scope
//! decision grounding this design.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChatFormat {
    #[default]
    Generic,
    Hermes2Pro,
    Llama3x,
    FunctionaryV3_1,
    FunctionaryV3_2,
    FirefunctionV2,
    CommandR7B,
    DeepSeekR1,
    DeepSeekV3_1,
    MistralNemo,
    Magistral,
    Qwen3CoderXml,
    Granite,
    GptOss,
    NemotronV2,
    SeedOss,
    Apertus,
    Lfm2,
    MiniMaxM2,
    Glm4_5,
    Glm4_6,
    KimiK2,
}

/// Which bespoke extractor a format routes to. Several formats share an
/// extractor and differ only in their delimiter/tag configuration, per the
/// SPEC_FULL.md §7 scope decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    Hermes,
    Llama3,
    DeepSeekR1,
    GptOss,
    Qwen3Xml,
    Generic,
}

#[derive(Debug, Clone)]
pub struct FormatSpec {
    pub extractor: Extractor,
    /// Tag pair wrapping a reasoning span, e.g. `("<think>", "</think>")`.
    pub reasoning_tags: Option<(&'static str, &'static str)>,
    /// Tag pair wrapping a tool call payload for formats using the Hermes
    /// or Generic extractor.
    pub tool_call_tags: Option<(&'static str, &'static str)>,
    /// True when the model emits reasoning without a wrapping end tag until
    /// a content channel switch (DeepSeek-R1 style "may omit the close
    /// token").
    pub reasoning_may_omit_close: bool,
}

impl ChatFormat {
    pub fn spec(self) -> FormatSpec {
        use ChatFormat::*;
        use Extractor::*;
        match self {
            Generic => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: None,
                reasoning_may_omit_close: false,
            },
            Hermes2Pro => FormatSpec {
                extractor: Hermes,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: Some(("<tool_call>", "</tool_call>")),
                reasoning_may_omit_close: false,
            },
            FunctionaryV3_1 | FunctionaryV3_2 => FormatSpec {
                extractor: Hermes,
                reasoning_tags: None,
                tool_call_tags: Some((">>>", "\n")),
                reasoning_may_omit_close: false,
            },
            FirefunctionV2 => FormatSpec {
                extractor: Hermes,
                reasoning_tags: None,
                tool_call_tags: Some((" functools[", "]")),
                reasoning_may_omit_close: false,
            },
            Llama3x => FormatSpec {
                extractor: Llama3,
                reasoning_tags: None,
                tool_call_tags: None,
                reasoning_may_omit_close: false,
            },
            DeepSeekR1 => FormatSpec {
                extractor: DeepSeekR1,
                reasoning_tags: Some(("", "</think>")),
                tool_call_tags: Some((
                    "<｜tool_calls_begin｜>",
                    "<｜tool_calls_end｜>",
                )),
                reasoning_may_omit_close: true,
            },
            DeepSeekV3_1 => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: Some(("<｜tool_calls_begin｜>", "<｜tool_calls_end｜>")),
                reasoning_may_omit_close: true,
            },
            MistralNemo | Magistral => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("[THINK]", "[/THINK]")),
                tool_call_tags: Some(("[TOOL_CALLS]", "")),
                reasoning_may_omit_close: false,
            },
            CommandR7B => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<|START_THINKING|>", "<|END_THINKING|>")),
                tool_call_tags: Some(("<|START_ACTION|>", "<|END_ACTION|>")),
                reasoning_may_omit_close: false,
            },
            Qwen3CoderXml => FormatSpec {
                extractor: Qwen3Xml,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: Some(("<tool_call>", "</tool_call>")),
                reasoning_may_omit_close: false,
            },
            Granite => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: Some(("<tool_call>", "</tool_call>")),
                reasoning_may_omit_close: false,
            },
            GptOss => FormatSpec {
                extractor: GptOss,
                reasoning_tags: None,
                tool_call_tags: None,
                reasoning_may_omit_close: false,
            },
            NemotronV2 => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: Some(("<TOOLCALL>", "</TOOLCALL>")),
                reasoning_may_omit_close: false,
            },
            SeedOss => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<seed:think>", "</seed:think>")),
                tool_call_tags: Some(("<seed:tool_call>", "</seed:tool_call>")),
                reasoning_may_omit_close: false,
            },
            Apertus => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<|inner_prefix|>", "<|inner_suffix|>")),
                tool_call_tags: Some(("<|tools_prefix|>", "<|tools_suffix|>")),
                reasoning_may_omit_close: false,
            },
            Lfm2 => FormatSpec {
                extractor: Generic,
                reasoning_tags: None,
                tool_call_tags: Some(("<|tool_call_start|>", "<|tool_call_end|>")),
                reasoning_may_omit_close: false,
            },
            MiniMaxM2 => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: Some(("<minimax:tool_call>", "</minimax:tool_call>")),
                reasoning_may_omit_close: false,
            },
            Glm4_5 | Glm4_6 => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: Some(("<tool_call>", "</tool_call>")),
                reasoning_may_omit_close: false,
            },
            KimiK2 => FormatSpec {
                extractor: Generic,
                reasoning_tags: Some(("<think>", "</think>")),
                tool_call_tags: Some((
                    "<|tool_calls_section_begin|>",
                    "<|tool_calls_section_end|>",
                )),
                reasoning_may_omit_close: false,
            },
        }
    }
}
