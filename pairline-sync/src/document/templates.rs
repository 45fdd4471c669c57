//! Starter code for each supported language.

use super::Language;

pub(super) fn template(language: Language) -> &'static str {
    match language {
        Language::Python => PYTHON,
        Language::JavaScript => JAVASCRIPT,
        Language::TypeScript => TYPESCRIPT,
        Language::Java => JAVA,
        Language::Cpp => CPP,
        Language::Go => GO,
        Language::Rust => RUST,
    }
}

const PYTHON: &str = "\
def solution():
    # Write your code here
    pass


if __name__ == \"__main__\":
    print(solution())
";

const JAVASCRIPT: &str = "\
function solution() {
  // Write your code here
}

console.log(solution());
";

const TYPESCRIPT: &str = "\
function solution(): unknown {
  // Write your code here
  return undefined;
}

console.log(solution());
";

const JAVA: &str = "\
public class Main {
    static Object solution() {
        // Write your code here
        return null;
    }

    public static void main(String[] args) {
        System.out.println(solution());
    }
}
";

const CPP: &str = "\
#include <iostream>
using namespace std;

int solution() {
    // Write your code here
    return 0;
}

int main() {
    cout << solution() << endl;
    return 0;
}
";

const GO: &str = "\
package main

import \"fmt\"

func solution() int {
\t// Write your code here
\treturn 0
}

func main() {
\tfmt.Println(solution())
}
";

const RUST: &str = "\
fn solution() -> i32 {
    // Write your code here
    0
}

fn main() {
    println!(\"{}\", solution());
}
";
