//! Prompt templates for every model call the engine makes.

use crate::model::{Blueprint, ChapterOutline, PartOutline};

pub const BLUEPRINT_SYSTEM: &str =
    "你是一位资深网文主编，擅长把模糊的灵感整理成完整的小说企划。你只输出严格的 JSON。";

pub const OUTLINE_SYSTEM: &str =
    "你是一位经验丰富的网文大纲策划，负责把小说企划拆解成连贯的卷纲与章纲。你只输出严格的 JSON。";

pub const CHAPTER_SYSTEM: &str =
    "你是一位高水准的网文作者，文笔流畅，情节连贯，擅长在既定大纲内写出引人入胜的章节正文。";

pub const ANALYSIS_SYSTEM: &str =
    "你是一位严谨的小说编辑助手，负责从章节正文中提取结构化信息。你只输出严格的 JSON，不输出任何解释。";

pub fn build_blueprint_prompt(initial_prompt: &str, history: &[String]) -> String {
    let history_block = if history.is_empty() {
        String::new()
    } else {
        format!("\n此前的讨论记录:\n{}\n", history.join("\n"))
    };

    format!(
        r#"根据下面的创作灵感，设计一部长篇小说的完整企划。
创作灵感: {initial_prompt}
{history_block}
输出一个 JSON 对象，字段如下:
{{
  "title": "书名",
  "genre": "类型",
  "style": "文风",
  "tone": "基调",
  "target_audience": "目标读者",
  "one_sentence_summary": "一句话简介",
  "full_synopsis": "完整故事梗概，至少三段",
  "world_setting": {{"key_locations": ["地点1", "地点2"], "power_system": "...", "...": "其他世界观要素"}},
  "needs_part_outlines": true,
  "total_chapters": 100,
  "chapters_per_part": 25,
  "characters": [
    {{"name": "姓名", "identity": "身份", "personality": "性格", "goals": "目标", "abilities": "能力", "relationship_to_protagonist": "与主角的关系", "position": 1}}
  ],
  "relationships": [
    {{"character_from": "甲", "character_to": "乙", "description": "关系描述", "position": 1}}
  ]
}}

要求:
1. total_chapters 根据故事体量取 20 到 500 之间的合理值；长篇(30章以上)将 needs_part_outlines 设为 true 并给出 chapters_per_part。
2. 主要角色 4 到 8 人，主角排在第一位。
3. 只输出 JSON，不要输出其他内容。"#,
    )
}

pub fn build_blueprint_refine_prompt(current: &Blueprint, instruction: &str) -> String {
    let current_json = serde_json::to_string_pretty(current).unwrap_or_default();
    format!(
        r#"下面是一部小说的现有企划 JSON:
{current_json}

修改要求: {instruction}

按同样的 JSON 结构输出修改后的完整企划。未被要求修改的字段保持原样。只输出 JSON。"#,
    )
}

pub fn build_part_outline_prompt(
    blueprint: &Blueprint,
    previous_parts: &[PartOutline],
    part_number: u32,
    start_chapter: u32,
    end_chapter: u32,
    optimization_prompt: Option<&str>,
) -> String {
    let previous_block = if previous_parts.is_empty() {
        "这是全书的第一卷。".to_string()
    } else {
        let parts = previous_parts
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("\n\n");
        format!("此前已定稿的卷纲:\n\n{}", parts)
    };
    let extra = optimization_prompt
        .filter(|p| !p.is_empty())
        .map(|p| format!("\n额外要求: {}\n", p))
        .unwrap_or_default();

    format!(
        r#"为小说《{title}》设计第 {part_number} 卷的卷纲，覆盖第 {start_chapter} 章到第 {end_chapter} 章。

故事梗概: {synopsis}

{previous_block}
{extra}
输出一个 JSON 对象:
{{
  "title": "卷名",
  "summary": "本卷剧情概述，至少两段",
  "theme": "本卷主题",
  "key_events": ["事件1", "事件2"],
  "conflicts": ["冲突1", "冲突2"],
  "character_arcs": {{"角色名": "本卷中的成长线"}},
  "ending_hook": "卷末悬念"
}}

要求: 与前卷自然衔接，只规划本卷，只输出 JSON。"#,
        title = blueprint.title,
        synopsis = blueprint.full_synopsis,
    )
}

pub struct OutlineBatchContext<'a> {
    pub current_part: Option<&'a PartOutline>,
    pub previous_ending_hook: Option<&'a str>,
    pub next_part_summary: Option<&'a str>,
}

pub fn build_chapter_outline_batch_prompt(
    blueprint: &Blueprint,
    previous_outlines: &[ChapterOutline],
    part_context: &OutlineBatchContext<'_>,
    start_chapter: u32,
    end_chapter: u32,
) -> String {
    let previous_block = if previous_outlines.is_empty() {
        "这是全书最开始的章节。".to_string()
    } else {
        let outlines = previous_outlines
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        format!("此前已定稿的章纲:\n{}", outlines)
    };

    let mut part_block = String::new();
    if let Some(part) = part_context.current_part {
        part_block.push_str(&format!("当前卷的卷纲:\n{}\n\n", part));
    }
    if let Some(hook) = part_context.previous_ending_hook {
        part_block.push_str(&format!("上一卷的卷末悬念: {}\n\n", hook));
    }
    if let Some(next) = part_context.next_part_summary {
        part_block.push_str(&format!("下一卷的概述(用于铺垫): {}\n\n", next));
    }

    format!(
        r#"为小说《{title}》撰写第 {start_chapter} 章到第 {end_chapter} 章的章纲。

故事梗概: {synopsis}

{part_block}{previous_block}

输出一个 JSON 对象:
{{
  "outlines": [
    {{"chapter_number": {start_chapter}, "title": "章节标题", "summary": "本章概要，80到150字"}}
  ]
}}

要求:
1. outlines 恰好包含第 {start_chapter} 到第 {end_chapter} 章，章号连续。
2. 每章概要与前文自然衔接，推进当前卷的剧情。
3. 只输出 JSON。"#,
        title = blueprint.title,
        synopsis = blueprint.full_synopsis,
    )
}

pub fn build_chapter_prompt(
    context_block: &str,
    chapter_outline: &ChapterOutline,
    writing_notes: Option<&str>,
    custom_prompt: Option<&str>,
) -> String {
    let mut goal = format!(
        "标题: {}\n概要: {}",
        chapter_outline.title, chapter_outline.summary
    );
    if let Some(notes) = writing_notes.filter(|n| !n.is_empty()) {
        goal.push_str(&format!("\n写作要求: {}", notes));
    }
    if let Some(custom) = custom_prompt.filter(|c| !c.is_empty()) {
        goal.push_str(&format!("\n补充要求: {}", custom));
    }

    format!(
        r#"{context_block}

[当前章节目标]
{goal}

依据以上全部上下文，写出第 {chapter_number} 章的完整正文。

输出一个 JSON 对象: {{"title": "章节标题", "content": "章节正文"}}

要求:
1. 正文 2500 到 4000 字，与上一章结尾自然衔接。
2. 不要复述前情，不要出现"本章"之类的元叙述。
3. 照应待回收的伏笔，保持人物状态连贯。
4. 只输出 JSON。"#,
        chapter_number = chapter_outline.chapter_number,
    )
}

pub fn build_analysis_prompt(
    content: &str,
    title: &str,
    chapter_number: u32,
    novel_title: &str,
) -> String {
    format!(
        r#"下面是小说《{novel_title}》第 {chapter_number} 章《{title}》的正文:

{content}

提取本章的结构化信息，输出一个 JSON 对象:
{{
  "metadata": {{"characters": ["出场角色"], "locations": ["地点"], "items": ["重要物品"], "tags": ["标签"], "tone": "本章基调", "timeline_marker": "时间线标记"}},
  "summaries": {{"compressed": "200字以内的压缩摘要", "one_line": "一句话摘要", "keywords": ["关键词"]}},
  "character_states": {{"角色名": {{"location": "所在位置", "status": "当前状态", "changes": ["本章发生的变化"]}}}},
  "foreshadowing": {{
    "planted": [{{"description": "新埋下的伏笔", "original_text": "原文摘句", "category": "类别", "priority": "high|medium|low", "related_entities": ["相关角色或物品"]}}],
    "resolved": [{{"id": "被回收伏笔的ID(如已知)", "resolution": "回收方式"}}],
    "tensions": ["仍未解决的张力"]
  }},
  "key_events": [{{"type": "事件类型", "description": "事件描述", "importance": "high|medium|low"}}]
}}

只输出 JSON，不要输出其他内容。"#,
    )
}

pub fn build_summary_prompt(content: &str, title: &str, chapter_number: u32) -> String {
    format!(
        r#"概括小说第 {chapter_number} 章《{title}》的剧情，150字以内，只输出摘要正文。

正文:
{content}"#,
    )
}
