use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use airspeed::{DictLoader, HostObject, HostResult, Template, TemplateError, Value};

fn merge(source: &str, context: Value) -> String {
    Template::new(source)
        .expect("parse")
        .merge(&context, None)
        .expect("merge")
}

fn merge_err(source: &str, context: Value) -> TemplateError {
    Template::new(source)
        .expect("parse")
        .merge(&context, None)
        .expect_err("merge should fail")
}

fn empty() -> Value {
    Value::Map(Vec::new())
}

// ---------------------------------------------------------------------
// #macro
// ---------------------------------------------------------------------

#[test]
fn macro_with_no_parameters() {
    assert_eq!(merge("#macro ( hello)hi#end#hello ()#hello()", empty()), "hihi");
}

#[test]
fn macro_with_one_parameter() {
    assert_eq!(
        merge(
            "#macro ( bold $value)<strong>$value</strong>#end#bold ($text)",
            Value::map([("text", "hello")])
        ),
        "<strong>hello</strong>"
    );
}

#[test]
fn macro_parameters_with_and_without_commas() {
    let context = Value::map([("text", "hello"), ("monkey", "cheese")]);
    assert_eq!(
        merge(
            "#macro ( bold $value $other)<strong>$value</strong>$other#end#bold ($text $monkey)",
            context.clone()
        ),
        "<strong>hello</strong>cheese"
    );
    assert_eq!(
        merge(
            "#macro ( bold $value, $other)<strong>$value</strong>$other#end#bold ($text, $monkey)",
            context
        ),
        "<strong>hello</strong>cheese"
    );
}

#[test]
fn macro_names_are_case_insensitive() {
    assert_eq!(
        merge(
            "#macro ( bold $value)<strong>$value</strong>#end#BoLd ($text)",
            Value::map([("text", "hello")])
        ),
        "<strong>hello</strong>"
    );
}

#[test]
fn macro_call_arguments_may_span_lines() {
    assert_eq!(
        merge(
            "#macro (hello $value1 $value2 )hello $value1 and $value2#end#hello (1,\n 2)",
            empty()
        ),
        "hello 1 and 2"
    );
}

#[test]
fn macro_arguments_separated_by_spaces() {
    assert_eq!(
        merge("#macro (addition $value1 $value2 )$value1+$value2#end#addition (1 2)", empty()),
        "1+2"
    );
    assert_eq!(
        merge(
            "#macro (addition $value1 $value2 )$value1+$value2#end#addition( $one   $two )",
            Value::map([("one", "ONE"), ("two", "TWO")])
        ),
        "ONE+TWO"
    );
}

#[test]
fn macro_renders_for_each_call() {
    assert_eq!(merge("#macro(g $a)[$a]#end#g(\"x\")#g(42)", empty()), "[x][42]");
}

#[test]
fn recursive_macro_calls_are_allowed() {
    assert_eq!(
        merge(
            "#macro ( recur $number)#if ($number > 0)#set($number = $number - 1)#recur($number)X#end#end#recur(5)",
            empty()
        ),
        "XXXXX"
    );
}

#[test]
fn macro_body_does_not_see_caller_locals() {
    // $v lives in the loop frame at the call site; the macro body only sees
    // its parameters, the base frame, and the root context.
    assert_eq!(
        merge(
            "#macro(m)$v#end#foreach($i in [1])#set($v = 'loop-local')#m()#end",
            empty()
        ),
        "$v"
    );
}

#[test]
fn macro_body_sees_template_level_bindings() {
    assert_eq!(merge("#set($g = 'G')#macro(m)$g#end#m()", empty()), "G");
}

#[test]
fn macro_body_does_not_leak_bindings() {
    assert_eq!(merge("#macro(tryme)$values#end#tryme()", empty()), "$values");
}

#[test]
fn calling_an_undefined_macro_is_an_error() {
    assert!(matches!(
        merge_err("#undefined()", empty()),
        TemplateError::Execution { .. }
    ));
}

#[test]
fn macro_arity_mismatch_is_an_error() {
    assert!(matches!(
        merge_err("#macro(m $a)x#end#m()", empty()),
        TemplateError::Execution { .. }
    ));
}

#[test]
fn redefining_a_macro_shadows_at_the_next_call() {
    assert_eq!(
        merge("#macro ( hello)hi#end#hello()#macro(hello)again#end#hello()", empty()),
        "hiagain"
    );
}

#[test]
fn whitespace_around_macro_bodies_is_gobbled() {
    assert_eq!(
        merge("#macro ( blah )\nhello##\n#end\n#blah()", empty()),
        "hello"
    );
}

// ---------------------------------------------------------------------
// #define
// ---------------------------------------------------------------------

#[test]
fn define_renders_at_reference_time() {
    assert_eq!(merge("#define ( $hello)hi#end$hello()$hello()", empty()), "hihi");
    assert_eq!(merge("#define ( $hello)hi#end$hello", empty()), "hi");
}

#[test]
fn define_with_parameters() {
    assert_eq!(
        merge("#define ( $echo $v1 $v2)$v1$v2#end$echo(1,\"a\")$echo(\"b\",2)", empty()),
        "1ab2"
    );
    assert_eq!(
        merge(
            "#define ( $echo $v1 $v2)$v1$v2#end$echo(1,\"a\")$echo($echo(2,\"b\"),\"c\")",
            empty()
        ),
        "1a2bc"
    );
    assert_eq!(
        merge(
            "#define ( $echo $v1 $v2)$v1$v2#end$echo(1,\"a\")$echo(\"b\",$echo(3,\"c\"))",
            empty()
        ),
        "1ab3c"
    );
}

#[test]
fn define_sees_the_namespace_at_reference_time() {
    assert_eq!(
        merge(
            "#define ( $showindex )$foreach.index#end#foreach($x in [1,2,3])$showindex#end",
            empty()
        ),
        "012"
    );
    assert_eq!(
        merge(
            "#define( $myfunc )$ctx#end#set( $ctx = 'foo' )$myfunc#set( $ctx = 'bar' )$myfunc",
            empty()
        ),
        "foobar"
    );
}

#[test]
fn assigning_a_define_stores_its_rendered_text() {
    assert_eq!(
        merge("#define($b)X#end#set($copy = $b)$copy", empty()),
        "X"
    );
}

#[test]
fn self_referential_define_is_detected() {
    assert!(matches!(
        merge_err("#define($a)$a#end$a", empty()),
        TemplateError::Execution { .. }
    ));
}

// ---------------------------------------------------------------------
// #stop
// ---------------------------------------------------------------------

#[test]
fn stop_ends_the_current_template() {
    assert_eq!(merge("hello #stop world", empty()), "hello ");
}

#[test]
fn stop_in_a_parsed_template_does_not_end_the_outer_render() {
    let mut loader = DictLoader::new();
    loader.insert("inner", "A#stop B");
    let template = Template::new("X#parse(\"inner\")Y").expect("parse");
    assert_eq!(template.merge(&empty(), Some(&loader)).expect("merge"), "XAY");
}

// ---------------------------------------------------------------------
// #evaluate
// ---------------------------------------------------------------------

#[test]
fn evaluate_renders_a_dynamic_template() {
    let template = "#set($source1 = \"abc\")\n#set($select = \"1\")\n#set($dynamicsource = \"$source$select\")\n#evaluate($dynamicsource)";
    assert_eq!(merge(template, empty()), "abc");
}

#[test]
fn evaluate_propagates_parse_errors() {
    assert!(matches!(
        merge_err("#evaluate($bad)", Value::map([("bad", "#if(")])),
        TemplateError::Syntax { .. }
    ));
}

#[test]
fn evaluate_shares_the_namespace() {
    assert_eq!(
        merge("#evaluate(\"#set(\\$x = 5)\")$x", empty()),
        "5"
    );
}

// ---------------------------------------------------------------------
// #noescape
// ---------------------------------------------------------------------

#[test]
fn noescape_emits_the_body_verbatim() {
    assert_eq!(
        merge("#noescape$x #set($y = 1)#end", Value::map([("x", "value")])),
        "$x #set($y = 1)"
    );
    assert_eq!(merge("#noescape\nraw $stuff\n#end\n", empty()), "raw $stuff\n");
}

#[test]
fn unterminated_noescape_is_a_syntax_error() {
    assert!(matches!(
        Template::new("#noescape forever"),
        Err(TemplateError::Syntax { .. })
    ));
}

// ---------------------------------------------------------------------
// #include / #parse
// ---------------------------------------------------------------------

#[test]
fn include_emits_raw_contents() {
    let mut loader = DictLoader::new();
    loader.insert("foo.tmpl", "howdy $not_interpreted");
    let template = Template::new("Message is: #include (\"foo.tmpl\")!").expect("parse");
    assert_eq!(
        template.merge(&empty(), Some(&loader)).expect("merge"),
        "Message is: howdy $not_interpreted!"
    );
}

#[test]
fn include_accepts_multiple_names() {
    let mut loader = DictLoader::new();
    loader.insert("a", "aa");
    loader.insert("b", "bb");
    let template = Template::new("#include(\"a\", \"b\")").expect("parse");
    assert_eq!(template.merge(&empty(), Some(&loader)).expect("merge"), "aabb");
}

#[test]
fn include_without_a_loader_fails() {
    let template = Template::new("#include (\"foo.tmpl\")").expect("parse");
    assert!(matches!(
        template.merge(&empty(), None),
        Err(TemplateError::NotFound(_))
    ));
}

#[test]
fn parse_renders_the_loaded_template() {
    let mut loader = DictLoader::new();
    loader.insert("foo.tmpl", "$message");
    let template = Template::new("Message is: #parse (\"foo.tmpl\")!").expect("parse");
    assert_eq!(
        template
            .merge(&Value::map([("message", "hola")]), Some(&loader))
            .expect("merge"),
        "Message is: hola!"
    );

    let by_reference = Template::new("Message is: #parse ($foo)!").expect("parse");
    let context = Value::map([("foo", "foo.tmpl"), ("message", "hola")]);
    assert_eq!(
        by_reference.merge(&context, Some(&loader)).expect("merge"),
        "Message is: hola!"
    );
}

#[test]
fn parse_shares_the_namespace() {
    let mut loader = DictLoader::new();
    loader.insert("foo.tmpl", "#set($message = 'hola')");
    let template = Template::new("#parse(\"foo.tmpl\")Message is: $message!").expect("parse");
    assert_eq!(
        template.merge(&empty(), Some(&loader)).expect("merge"),
        "Message is: hola!"
    );
}

#[test]
fn parse_chain_binds_upward() {
    let mut loader = DictLoader::new();
    loader.insert("a", "#parse(\"b\")");
    loader.insert("b", "#set($x=1)$x");
    let template = Template::new("#parse(\"a\")").expect("parse");
    assert_eq!(template.merge(&empty(), Some(&loader)).expect("merge"), "1");
}

#[test]
fn macros_defined_in_parsed_files_are_callable() {
    let mut loader = DictLoader::new();
    loader.insert("foo.tmpl", "#macro(themacro)works#end");
    let template = Template::new("#parse(\"foo.tmpl\")#themacro()").expect("parse");
    assert_eq!(template.merge(&empty(), Some(&loader)).expect("merge"), "works");
}

#[test]
fn missing_parse_target_is_not_found() {
    let loader = DictLoader::new();
    let template = Template::new("#parse(\"nope\")").expect("parse");
    assert!(matches!(
        template.merge(&empty(), Some(&loader)),
        Err(TemplateError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------
// Host objects
// ---------------------------------------------------------------------

#[derive(Debug)]
struct Squared;

impl HostObject for Squared {
    fn call(&self, args: &[Value]) -> Option<HostResult> {
        match args {
            [Value::Int(n)] => Some(Ok(Value::Int(n * n))),
            _ => Some(Err("squared expects one integer".to_string())),
        }
    }
}

#[test]
fn callable_context_values() {
    let context = Value::map([
        ("squared", Value::object(Squared)),
        ("some_var", Value::Int(6)),
    ]);
    assert_eq!(merge("$squared(8)", context.clone()), "64");
    assert_eq!(merge("$squared($some_var)", context.clone()), "36");
    assert_eq!(merge("$squared($squared($some_var))", context), "1296");
}

#[derive(Debug)]
struct Person;

impl HostObject for Person {
    fn get_property(&self, name: &str) -> Option<Value> {
        (name == "first_name").then(|| Value::Str("Chris".into()))
    }

    fn invoke(&self, name: &str, args: &[Value]) -> Option<HostResult> {
        match (name, args) {
            ("getName", []) => Some(Ok(Value::Str("Christopher".into()))),
            ("boom", []) => Some(Err("kaboom".to_string())),
            _ => None,
        }
    }
}

#[test]
fn host_properties_resolve_through_the_protocol() {
    let context = Value::map([("name", Value::object(Person))]);
    assert_eq!(merge("Hello $name.first_name", context), "Hello Chris");
}

#[test]
fn bean_accessors_are_tried_in_order() {
    let context = Value::map([("o", Value::object(Person))]);
    assert_eq!(merge("$o.name", context), "Christopher");
}

#[test]
fn host_errors_propagate_even_through_quiet_references() {
    let context = Value::map([("o", Value::object(Person))]);
    assert!(matches!(
        merge_err("$!{o.boom()}", context),
        TemplateError::Host { .. }
    ));
}

#[test]
fn missing_host_property_renders_as_source_text() {
    let context = Value::map([("user", Value::object(Person))]);
    assert_eq!(merge(" $user.name2 ", context), " $user.name2 ");
}

#[derive(Debug)]
struct Chainable;

impl HostObject for Chainable {
    fn invoke(&self, name: &str, args: &[Value]) -> Option<HostResult> {
        match (name, args) {
            ("get_self", []) => Some(Ok(Value::object(Chainable))),
            ("method", [Value::Str(p)]) if p == "bat" => Some(Ok(Value::Str("monkey".into()))),
            ("method", _) => Some(Ok(Value::Null)),
            _ => None,
        }
    }
}

#[test]
fn method_call_arguments_use_the_caller_scope() {
    let context = Value::map([
        ("obj", Value::object(Chainable)),
        ("param", Value::Str("bat".into())),
    ]);
    assert_eq!(merge("$obj.get_self().method($param)", context), "monkey");
}

#[derive(Debug)]
struct GetArray;

impl HostObject for GetArray {
    fn call(&self, args: &[Value]) -> Option<HostResult> {
        if !args.is_empty() {
            return Some(Err("no arguments expected".to_string()));
        }
        Some(Ok(Value::seq([
            Value::Str("p1".into()),
            Value::seq([Value::Str("p2".into()), Value::Str("p3".into())]),
        ])))
    }
}

#[test]
fn indexing_into_a_call_result() {
    let context = Value::map([("get_array", Value::object(GetArray))]);
    assert_eq!(merge("$get_array()[0]", context.clone()), "p1");
    assert_eq!(merge("$get_array()[1][1]", context), "p3");
}

#[derive(Debug)]
struct Flag(bool);

impl HostObject for Flag {
    fn is_truthy(&self) -> bool {
        self.0
    }
}

#[test]
fn host_truthiness_is_honoured() {
    assert_eq!(merge("#if ($v)yes#end", Value::map([("v", Value::object(Flag(false)))])), "");
    assert_eq!(merge("#if ($v)yes#end", Value::map([("v", Value::object(Flag(true)))])), "yes");
    assert_eq!(merge("#if ( !$v)yes#end", Value::map([("v", Value::object(Flag(false)))])), "yes");
}

#[derive(Debug)]
struct Settings(Mutex<HashMap<String, Value>>);

impl HostObject for Settings {
    fn get_property(&self, name: &str) -> Option<Value> {
        self.0.lock().ok()?.get(name).cloned()
    }

    fn set_property(&self, name: &str, value: Value) -> bool {
        match self.0.lock() {
            Ok(mut entries) => {
                entries.insert(name.to_string(), value);
                true
            }
            Err(_) => false,
        }
    }
}

#[test]
fn set_writes_through_host_objects() {
    let settings = Arc::new(Settings(Mutex::new(HashMap::new())));
    let context = Value::map([("cfg", Value::Object(settings.clone()))]);
    assert_eq!(merge("#set($cfg.mode = 'fast')$cfg.mode", context), "fast");
    // Host-object writes use interior mutability, so the caller observes them.
    let stored = settings.0.lock().expect("lock").get("mode").cloned();
    assert_eq!(stored, Some(Value::Str("fast".into())));
}

#[derive(Debug)]
struct Numbers;

impl HostObject for Numbers {
    fn iterate(&self) -> Option<Vec<Value>> {
        Some(vec![Value::Int(10), Value::Int(20)])
    }
}

#[test]
fn host_objects_can_be_iterated() {
    let context = Value::map([("ns", Value::object(Numbers))]);
    assert_eq!(merge("#foreach($n in $ns)$n;#end", context), "10;20;");
}

#[derive(Debug)]
struct Greeter;

impl HostObject for Greeter {
    fn call(&self, args: &[Value]) -> Option<HostResult> {
        match args {
            [Value::Str(who)] => Some(Ok(Value::Str(format!("hello {}", who)))),
            [Value::Null] => Some(Ok(Value::Null)),
            _ => Some(Err("expected one argument".to_string())),
        }
    }
}

#[test]
fn callable_properties_inside_reference_chains() {
    let b = Value::map([("c", Value::object(Greeter))]);
    let context = Value::map([("a", Value::map([("b", b)]))]);
    assert_eq!(merge("#if($!{a.b.c('cheese')})yes!#end", context.clone()), "yes!");
    assert_eq!(merge("#if(${a.b.c('cheese')})yes!#end", context), "yes!");
    assert_eq!(merge("#if($!{a.b.c('cheese')})yes!#end", empty()), "");
    assert_eq!(merge("#if($!a.b.c('cheese'))yes!#end", empty()), "");
}
