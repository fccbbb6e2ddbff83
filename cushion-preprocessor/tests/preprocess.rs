//! End-to-end runs over real files: sources go into a temp directory, the
//! engine executes, and the preprocessed output is compared after stripping
//! line markers and collapsing whitespace.

use std::fs;

use cushion_preprocessor::{Context, Features, IncludeKind, Options};
use indoc::indoc;
use tempfile::TempDir;

struct Project {
    directory: TempDir,
}

impl Project {
    fn new() -> Self {
        Self {
            directory: TempDir::new().expect("temp directory"),
        }
    }

    fn file(&self, name: &str, content: &str) -> String {
        let path = self.directory.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directories");
        }
        fs::write(&path, content).expect("write source file");
        path.to_str().expect("UTF-8 path").to_owned()
    }

    fn path(&self, name: &str) -> String {
        self.directory
            .path()
            .join(name)
            .to_str()
            .expect("UTF-8 path")
            .to_owned()
    }
}

fn run(project: &Project, inputs: &[&str], configure: impl FnOnce(&mut Context)) -> String {
    let mut context = Context::new();
    for input in inputs {
        context.add_input(project.path(input));
    }
    context.set_output(project.path("preprocessed.c"));
    configure(&mut context);
    context.execute().expect("preprocessing should succeed");
    fs::read_to_string(project.path("preprocessed.c")).expect("read output")
}

fn run_error(project: &Project, inputs: &[&str], configure: impl FnOnce(&mut Context)) -> String {
    let mut context = Context::new();
    for input in inputs {
        context.add_input(project.path(input));
    }
    context.set_output(project.path("preprocessed.c"));
    configure(&mut context);
    context.execute().expect_err("preprocessing should fail").to_string()
}

/// Output lines without markers and leading/trailing whitespace, with inner
/// whitespace runs collapsed.
fn significant_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("#line"))
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}

/// Output with markers dropped and all whitespace removed; for brace-heavy
/// expansions where exact spacing is not part of the contract.
fn compact(output: &str) -> String {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("#line"))
        .collect::<String>()
        .split_whitespace()
        .collect()
}

#[test]
fn trivial_object_like_macro() {
    let project = Project::new();
    project.file("main.c", "#define X (1+2)\nint y = X;\n");
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["int y = ( 1 + 2 ) ;"]);
}

#[test]
fn stringize_and_paste() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {r#"
            #define S(x) #x
            #define C(a,b) a##b
            const char *s = S(a b); int C(var,42) = 0;
        "#},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(
        significant_lines(&output),
        [r#"const char *s = "a b" ; int var42 = 0;"#]
    );
}

#[test]
fn variadic_macro_with_va_opt() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {r#"
            #define F(fmt, ...) printf(fmt __VA_OPT__(,) __VA_ARGS__)
            F("x");
            F("y", 1, 2);
        "#},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(
        significant_lines(&output),
        [r#"printf ( "x" ) ;"#, r#"printf ( "y" , 1 , 2 ) ;"#]
    );
}

#[test]
fn conditional_with_macro_evaluated_expression() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #define E (3*4+7)
            #if 1+E==20
            A
            #endif
            #if 1+E==23
            B
            #endif
        "},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["A"]);
}

#[test]
fn pragma_once_across_inputs() {
    let project = Project::new();
    project.file("h.h", "#pragma once\nint k;\n");
    project.file("first.c", "#include \"h.h\"\n");
    project.file("second.c", "#include \"h.h\"\n");
    let output = run(&project, &["first.c", "second.c"], |_| {});
    assert_eq!(significant_lines(&output), ["int k;"]);
}

#[test]
fn wrapper_macro_keeps_wrapped_block() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #define W { while(1) { __CUSHION_WRAPPED__ } }
            W { break; }
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::WRAPPER_MACRO);
    });
    assert_eq!(compact(&output), "{while(1){{break;}}}");
}

#[test]
fn wrapper_macro_requires_the_feature() {
    let project = Project::new();
    project.file(
        "main.c",
        "#define W { __CUSHION_WRAPPED__ }\nW { x; }\n",
    );
    let message = run_error(&project, &["main.c"], |_| {});
    assert!(message.contains("__CUSHION_WRAPPED__"), "{message}");
}

#[test]
fn statement_accumulator_collects_pushes_in_order() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            struct context_t {
                CUSHION_STATEMENT_ACCUMULATOR(fields)
            };
            CUSHION_STATEMENT_ACCUMULATOR_PUSH(fields) { int field_1; }
            CUSHION_STATEMENT_ACCUMULATOR_PUSH(fields) { int field_2; }
            CUSHION_STATEMENT_ACCUMULATOR_PUSH(fields) { int field_3; }
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::STATEMENT_ACCUMULATOR);
    });
    assert_eq!(
        significant_lines(&output),
        [
            "struct context_t {",
            "int field_1;",
            "int field_2;",
            "int field_3;",
            "};"
        ]
    );
}

#[test]
fn statement_accumulator_unique_drops_equal_bodies() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            struct s {
                CUSHION_STATEMENT_ACCUMULATOR(fields)
            };
            CUSHION_STATEMENT_ACCUMULATOR_PUSH(fields, unique) { int once; }
            CUSHION_STATEMENT_ACCUMULATOR_PUSH(fields, unique) { int once; }
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::STATEMENT_ACCUMULATOR);
    });
    assert_eq!(
        significant_lines(&output),
        ["struct s {", "int once;", "};"]
    );
}

#[test]
fn unordered_push_binds_through_reference() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            CUSHION_STATEMENT_ACCUMULATOR_PUSH(alias, unordered) { early(); }
            struct s {
                CUSHION_STATEMENT_ACCUMULATOR(real)
            };
            CUSHION_STATEMENT_ACCUMULATOR_REF(alias, real)
            CUSHION_STATEMENT_ACCUMULATOR_PUSH(alias) { late(); }
            CUSHION_STATEMENT_ACCUMULATOR_UNREF(alias)
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::STATEMENT_ACCUMULATOR);
    });
    assert_eq!(
        significant_lines(&output),
        ["struct s {", "early();", "late();", "};"]
    );
}

#[test]
fn unresolved_non_optional_unordered_push_is_an_error() {
    let project = Project::new();
    project.file(
        "main.c",
        "CUSHION_STATEMENT_ACCUMULATOR_PUSH(nowhere, unordered) { x(); }\n",
    );
    let message = run_error(&project, &["main.c"], |context| {
        context.enable_feature(Features::STATEMENT_ACCUMULATOR);
    });
    assert!(message.contains("never found"), "{message}");
}

#[test]
fn optional_push_without_target_is_dropped() {
    let project = Project::new();
    project.file(
        "main.c",
        "CUSHION_STATEMENT_ACCUMULATOR_PUSH(nowhere, optional) { x(); }\nint keep;\n",
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::STATEMENT_ACCUMULATOR);
    });
    assert_eq!(significant_lines(&output), ["int keep;"]);
}

#[test]
fn accumulator_requires_the_feature() {
    let project = Project::new();
    project.file("main.c", "CUSHION_STATEMENT_ACCUMULATOR(a)\n");
    let message = run_error(&project, &["main.c"], |_| {});
    assert!(message.contains("not enabled"), "{message}");
}

#[test]
fn unknown_undef_is_echoed() {
    let project = Project::new();
    project.file("main.c", "#undef UNKNOWN\n");
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["#undef UNKNOWN"]);
}

#[test]
fn preserved_macro_survives_verbatim() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #define KEEP __CUSHION_PRESERVE__ value
            KEEP x;
            #undef KEEP
        "},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(
        significant_lines(&output),
        ["#define KEEP value", "KEEP x;", "#undef KEEP"]
    );
}

#[test]
fn preserved_conditional_keeps_skeleton_and_both_branches() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #if __CUSHION_PRESERVE__ SOMETHING_EXTERNAL
            int a;
            #else
            int b;
            #endif
        "},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(
        significant_lines(&output),
        ["#if SOMETHING_EXTERNAL", "int a;", "#else", "int b;", "#endif"]
    );
}

#[test]
fn scan_only_include_contributes_macros_but_no_tokens() {
    let project = Project::new();
    project.file("inc/defs.h", "#define FROM_SCAN 123\nint never_emitted;\n");
    project.file("main.c", "#include \"defs.h\"\nint x = FROM_SCAN;\n");
    let output = run(&project, &["main.c"], |context| {
        context.add_include(project.path("inc"), IncludeKind::Scan);
    });
    let lines = significant_lines(&output);
    assert_eq!(lines, ["#include \"defs.h\"", "int x = 123 ;"]);
    assert!(!output.contains("never_emitted"));
}

#[test]
fn full_include_pulls_content_and_restores_line() {
    let project = Project::new();
    project.file("inc/header.h", "int from_header;\n");
    project.file("main.c", "#include \"header.h\"\nint after;\n");
    let output = run(&project, &["main.c"], |context| {
        context.add_include(project.path("inc"), IncludeKind::Full);
    });
    assert_eq!(
        significant_lines(&output),
        ["int from_header;", "int after;"]
    );
    assert!(output.contains("header.h\""), "{output}");
}

#[test]
fn unresolved_include_is_echoed() {
    let project = Project::new();
    project.file("main.c", "#include <sys/nothing_here.h>\nint x;\n");
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(
        significant_lines(&output),
        ["#include <sys/nothing_here.h>", "int x;"]
    );
}

#[test]
fn depfile_lists_every_opened_file() {
    let project = Project::new();
    project.file("inc/header.h", "int from_header;\n");
    project.file("inc/scanned.h", "#define A 1\n");
    project.file(
        "main.c",
        "#include \"header.h\"\n#include \"scanned.h\"\n",
    );
    run(&project, &["main.c"], |context| {
        context.add_include(project.path("inc"), IncludeKind::Full);
        context.add_include(project.path("inc"), IncludeKind::Scan);
        context.set_depfile(project.path("deps.d"));
    });
    let depfile = fs::read_to_string(project.path("deps.d")).unwrap();
    assert!(depfile.starts_with(&format!("\"{}\":", project.path("preprocessed.c"))));
    assert!(depfile.contains("main.c"), "{depfile}");
    assert!(depfile.contains("header.h"), "{depfile}");
    assert!(depfile.ends_with('\n'));
}

#[test]
fn line_directive_rewrites_position() {
    let project = Project::new();
    project.file("main.c", "#line 100 \"virtual.c\"\nint q;\n");
    let output = run(&project, &["main.c"], |_| {});
    assert!(output.contains("#line 100 \"virtual.c\""), "{output}");
    assert!(significant_lines(&output).contains(&"int q;".to_owned()));
}

#[test]
fn file_and_line_builtins_expand() {
    let project = Project::new();
    project.file("main.c", "int l = __LINE__;\nconst char *f = __FILE__;\n");
    let output = run(&project, &["main.c"], |_| {});
    let lines = significant_lines(&output);
    assert_eq!(lines[0], "int l = 1;");
    assert!(lines[1].starts_with("const char *f = \""), "{output}");
    assert!(lines[1].contains("main.c\";"), "{output}");
}

#[test]
fn macro_pragma_emits_pragma_line() {
    let project = Project::new();
    project.file("main.c", "_Pragma(\"pack(1)\")\nint x;\n");
    let output = run(&project, &["main.c"], |_| {});
    assert!(output.contains("#pragma pack(1)"), "{output}");
}

#[test]
fn non_once_pragma_is_echoed() {
    let project = Project::new();
    project.file("main.c", "#pragma GCC poison evil\n");
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["#pragma GCC poison evil"]);
}

#[test]
fn elif_else_chain_picks_first_true_branch() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #if 0
            a;
            #elif 1
            b;
            #else
            c;
            #endif
        "},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["b;"]);
}

#[test]
fn nested_conditionals_under_excluded_parent() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #if 0
            #if 1
            x;
            #endif
            #else
            y;
            #endif
        "},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["y;"]);
}

#[test]
fn ternary_and_character_literals_in_conditions() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #if ('A' == 65) && (1 ? 2 : 0)
            ok;
            #endif
        "},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["ok;"]);
}

#[test]
fn ifdef_family_consults_the_macro_table() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #define PRESENT 1
            #ifdef PRESENT
            a;
            #endif
            #ifndef PRESENT
            b;
            #endif
            #ifdef MISSING
            c;
            #elifdef PRESENT
            d;
            #endif
        "},
    );
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["a;", "d;"]);
}

#[test]
fn undefined_identifier_in_condition_is_an_error() {
    let project = Project::new();
    project.file("main.c", "#if MYSTERY\nx;\n#endif\n");
    let message = run_error(&project, &["main.c"], |_| {});
    assert!(message.contains("integer constant"), "{message}");
}

#[test]
fn has_include_is_rejected() {
    let project = Project::new();
    project.file("main.c", "#if __has_include(<stdio.h>)\nx;\n#endif\n");
    let message = run_error(&project, &["main.c"], |_| {});
    assert!(message.contains("__has_"), "{message}");
}

#[test]
fn small_line_gaps_become_plain_newlines() {
    let project = Project::new();
    project.file("main.c", "int a;\n\n\nint b;\n");
    let output = run(&project, &["main.c"], |_| {});
    assert!(output.contains("int a;\n\n\nint b;"), "{output}");
}

#[test]
fn large_line_gaps_become_line_markers() {
    let project = Project::new();
    project.file("main.c", "int a;\n\n\n\n\n\n\nint b;\n");
    let output = run(&project, &["main.c"], |_| {});
    assert!(output.contains("#line 8"), "{output}");
}

#[test]
fn macro_redefinition_policy() {
    let project = Project::new();
    let source = "#define X 1\n#define X 2\nint y = X;\n";
    project.file("main.c", source);

    // Silent replacement by default.
    let output = run(&project, &["main.c"], |_| {});
    assert_eq!(significant_lines(&output), ["int y = 2 ;"]);

    // An error under the strict option.
    let message = run_error(&project, &["main.c"], |context| {
        context.enable_option(Options::FORBID_MACRO_REDEFINITION);
    });
    assert!(message.contains("redefinition"), "{message}");
}

#[test]
fn configuration_defines_participate_in_conditions() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #if ENABLED
            int on = VALUE;
            #endif
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.define("ENABLED", "1").define("VALUE", "40 + 2");
    });
    assert_eq!(significant_lines(&output), ["int on = 40 + 2 ;"]);
}

#[test]
fn encoded_literals_pass_through_verbatim() {
    let project = Project::new();
    project.file(
        "main.c",
        "const void *a = u8\"text\"; int b = U'x'; const void *c = L\"wide\\n\";\n",
    );
    let output = run(&project, &["main.c"], |_| {});
    assert!(output.contains("u8\"text\""), "{output}");
    assert!(output.contains("U'x'"), "{output}");
    assert!(output.contains("L\"wide\\n\""), "{output}");
}

#[test]
fn defer_runs_at_scope_exit() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            void f() {
                CUSHION_DEFER { cleanup(); }
                work();
            }
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::DEFER);
    });
    assert_eq!(
        significant_lines(&output),
        ["void f() {", "work();", "cleanup();", "}"]
    );
}

#[test]
fn defer_runs_before_break_and_not_twice_after_it() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            void f() {
                while (1) {
                    CUSHION_DEFER { step(); }
                    break;
                }
            }
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::DEFER);
    });
    assert_eq!(
        significant_lines(&output),
        ["void f() {", "while (1) {", "step();", "break;", "}", "}"]
    );
}

#[test]
fn defer_caches_return_values() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            int f() {
                CUSHION_DEFER { done(); }
                return 1 + 2;
            }
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::DEFER);
    });
    assert_eq!(
        significant_lines(&output),
        [
            "int f() {",
            "typeof (1 + 2) cushion_cached_return_value_0 = 1 + 2;",
            "done();",
            "return cushion_cached_return_value_0;",
            "}"
        ]
    );
}

#[test]
fn defer_in_switch_cases() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            void f(int argc) {
                switch (argc) {
                case 0: {
                    CUSHION_DEFER { first(); }
                    break;
                }
                default:
                    break;
                }
            }
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::DEFER);
    });
    assert_eq!(
        significant_lines(&output),
        [
            "void f(int argc) {",
            "switch (argc) {",
            "case 0: {",
            "first();",
            "break;",
            "}",
            "default:",
            "break;",
            "}",
            "}"
        ]
    );
}

#[test]
fn goto_unwinds_inner_scopes() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            void f() {
                {
                    CUSHION_DEFER { undo(); }
                    goto out;
                }
            out:
                done();
            }
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::DEFER);
    });
    assert_eq!(
        significant_lines(&output),
        [
            "void f() {",
            "{",
            "undo();",
            "goto out;",
            "}",
            "out:",
            "done();",
            "}"
        ]
    );
}

#[test]
fn defer_requires_the_feature() {
    let project = Project::new();
    project.file("main.c", "void f() { CUSHION_DEFER { x(); } }\n");
    let message = run_error(&project, &["main.c"], |_| {});
    assert!(message.contains("defer feature"), "{message}");
}

#[test]
fn defer_bodies_reject_directives() {
    let project = Project::new();
    project.file(
        "main.c",
        "void f() {\n    CUSHION_DEFER {\n#define BAD 1\n    }\n}\n",
    );
    let message = run_error(&project, &["main.c"], |context| {
        context.enable_feature(Features::DEFER);
    });
    assert!(message.contains("directive"), "{message}");
}

#[test]
fn evaluated_argument_feeds_token_paste() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #define ALIAS inner_name
            #define PAIR(NAME) int field_##__CUSHION_EVALUATED_ARGUMENT__ (NAME);
            PAIR(ALIAS)
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::SNIPPET);
    });
    assert_eq!(compact(&output), "intfield_inner_name;");
}

#[test]
fn snippet_defines_reusable_token_sequence() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            CUSHION_SNIPPET (PATH, (ctx))
            PATH->x;
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::SNIPPET);
    });
    assert_eq!(compact(&output), "(ctx)->x;");
}

#[test]
fn replacement_index_counts_expansions() {
    let project = Project::new();
    project.file(
        "main.c",
        indoc! {"
            #define TAG() id_##__CUSHION_REPLACEMENT_INDEX__
            int TAG();
            int TAG();
        "},
    );
    let output = run(&project, &["main.c"], |context| {
        context.enable_feature(Features::SNIPPET);
    });
    assert_eq!(
        significant_lines(&output),
        ["int id_1 ;", "int id_2 ;"]
    );
}

#[test]
fn multiple_inputs_concatenate_in_order() {
    let project = Project::new();
    project.file("a.c", "int first;\n");
    project.file("b.c", "int second;\n");
    let output = run(&project, &["a.c", "b.c"], |_| {});
    assert_eq!(significant_lines(&output), ["int first;", "int second;"]);
}

#[test]
fn output_starts_with_a_line_marker_for_the_input() {
    let project = Project::new();
    project.file("main.c", "int x;\n");
    let output = run(&project, &["main.c"], |_| {});
    assert!(output.starts_with("#line 1 \""), "{output}");
    assert!(output.lines().next().unwrap().contains("main.c"), "{output}");
}
