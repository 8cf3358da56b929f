use crate::rag::context::{Section, TieredContext};

/// Fit a tiered context into `max_tokens` as measured by `counter`.
/// The required tier gets at most half the budget (dropping its droppable
/// sections first), important fills 70% of what remains, reference takes the
/// rest. Tier order is preserved and the result never exceeds the budget.
pub fn compress<F>(context: &TieredContext, max_tokens: usize, counter: F) -> String
where
    F: Fn(&str) -> usize,
{
    let separator_cost = counter("\n\n");

    let required_budget = max_tokens / 2;
    let required = render_tier(&context.required, required_budget, &counter);

    let used = counter(&required);
    let remaining = max_tokens.saturating_sub(used);

    let important_budget = remaining * 7 / 10;
    let important = if important_budget > separator_cost {
        render_tier(
            &context.important,
            important_budget.saturating_sub(separator_cost),
            &counter,
        )
    } else {
        String::new()
    };

    let used_important = if important.is_empty() {
        0
    } else {
        counter(&important) + separator_cost
    };
    let reference_budget = remaining.saturating_sub(used_important);
    let reference = if reference_budget > separator_cost {
        render_tier(
            &context.reference,
            reference_budget.saturating_sub(separator_cost),
            &counter,
        )
    } else {
        String::new()
    };

    let blocks: Vec<&str> = [required.as_str(), important.as_str(), reference.as_str()]
        .into_iter()
        .filter(|b| !b.is_empty())
        .collect();
    let mut result = blocks.join("\n\n");

    // Joining can only add separators already budgeted above, but guard the
    // contract anyway.
    if counter(&result) > max_tokens {
        result = truncate_to_budget(&result, max_tokens, &counter);
    }
    result
}

/// Render a tier's sections into one block within `budget`. Droppable
/// sections go first when over budget; what still does not fit is cut from
/// the tail.
fn render_tier<F>(sections: &[Section], budget: usize, counter: &F) -> String
where
    F: Fn(&str) -> usize,
{
    if sections.is_empty() || budget == 0 {
        return String::new();
    }

    let mut kept: Vec<&Section> = sections.iter().collect();
    let mut rendered = join_sections(&kept);

    while counter(&rendered) > budget {
        match kept.iter().position(|s| s.droppable) {
            Some(pos) => {
                kept.remove(pos);
                rendered = join_sections(&kept);
            }
            None => break,
        }
    }

    if counter(&rendered) > budget {
        rendered = truncate_to_budget(&rendered, budget, counter);
    }
    rendered
}

fn join_sections(sections: &[&Section]) -> String {
    sections
        .iter()
        .map(|s| s.render())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Longest char prefix whose token count fits the budget.
fn truncate_to_budget<F>(text: &str, budget: usize, counter: &F) -> String
where
    F: Fn(&str) -> usize,
{
    if counter(text) <= budget {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let mut lo = 0usize;
    let mut hi = chars.len();
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        let prefix: String = chars[..mid].iter().collect();
        if counter(&prefix) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    chars[..lo].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(label: &str, body: &str, droppable: bool) -> Section {
        Section {
            label: label.to_string(),
            body: body.to_string(),
            droppable,
        }
    }

    fn char_count(s: &str) -> usize {
        s.chars().count()
    }

    #[test]
    fn result_fits_budget() {
        let context = TieredContext {
            required: vec![section("[世界蓝图]", &"天".repeat(600), false)],
            important: vec![section("[前情摘要]", &"地".repeat(800), false)],
            reference: vec![section("[世界设定]", &"玄".repeat(800), false)],
        };
        for budget in [100, 500, 2000, 10_000] {
            let out = compress(&context, budget, char_count);
            assert!(char_count(&out) <= budget, "budget {} exceeded", budget);
        }
    }

    #[test]
    fn required_survives_small_budgets() {
        let context = TieredContext {
            required: vec![section("[当前章节目标]", "标题: 初入宗门", false)],
            important: vec![section("[前情摘要]", &"长".repeat(5000), false)],
            reference: vec![],
        };
        let out = compress(&context, 200, char_count);
        assert!(out.contains("初入宗门"));
    }

    #[test]
    fn droppable_required_sections_give_way() {
        let context = TieredContext {
            required: vec![
                section("[世界蓝图]", &"书".repeat(70), false),
                section("[主要角色]", &"名".repeat(200), true),
                section("[当前章节目标]", "目标正文", false),
            ],
            important: vec![],
            reference: vec![],
        };
        // Required budget = 100: the droppable roster must be removed and
        // the two mandatory sections kept.
        let out = compress(&context, 200, char_count);
        assert!(!out.contains('名'));
        assert!(out.contains("目标正文"));
    }

    #[test]
    fn reference_tier_is_first_to_vanish() {
        let context = TieredContext {
            required: vec![section("[世界蓝图]", &"图".repeat(90), false)],
            important: vec![section("[前情摘要]", &"情".repeat(90), false)],
            reference: vec![section("[世界设定]", &"设".repeat(90), false)],
        };
        let out = compress(&context, 240, char_count);
        assert!(out.contains('图'));
        assert!(out.contains('情'));
        // 240 budget: required ~96, important gets 70% of remainder; the
        // reference tier is squeezed to at most a stub.
        let reference_chars = out.chars().filter(|&c| c == '设').count();
        assert!(reference_chars < 90);
    }

    #[test]
    fn empty_context_renders_empty() {
        let out = compress(&TieredContext::default(), 1000, char_count);
        assert!(out.is_empty());
    }
}
